// SPDX-License-Identifier: Apache-2.0

use super::BoxError;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::error;

pub type TaskSet = JoinSet<Result<(), BoxError>>;

pub async fn wait_for_any_task(tasks: &mut TaskSet) -> Result<(), BoxError> {
    match tasks.join_next().await {
        // An empty set never completes, so it cannot win a select.
        None => std::future::pending().await,
        Some(res) => res?,
    }
}

/// Waits for every task, keeping the last error seen.
pub async fn wait_for_all_tasks(tasks: &mut TaskSet) -> Result<(), BoxError> {
    let mut result = Ok(());
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => result = Err(e),
            Err(e) => error!(error = %e, "Failed to join with task"),
        }
    }
    result
}

pub async fn wait_for_tasks_with_timeout(
    tasks: &mut TaskSet,
    timeout: Duration,
) -> Result<(), BoxError> {
    wait_for_tasks_with_deadline(tasks, Instant::now() + timeout).await
}

pub async fn wait_for_tasks_with_deadline(
    tasks: &mut TaskSet,
    stop_at: Instant,
) -> Result<(), BoxError> {
    match timeout_at(stop_at, wait_for_all_tasks(tasks)).await {
        Ok(result) => result,
        Err(_) => Err("timed out waiting for tasks to complete".into()),
    }
}
