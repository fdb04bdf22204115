// SPDX-License-Identifier: Apache-2.0

//! Pipeline assembly and lifecycle.
//!
//! Events flow harvester → spooler → publisher, acknowledgements flow
//! publisher → registrar. Shutdown runs leaf first: the prospector stops its
//! harvesters, then the spooler and publisher are cancelled, and the
//! registrar writes its final state once every client has let go of it.

pub mod wait;

use crate::admin::{ApiError, CallbackEntry, Node};
use crate::bounded_channel::bounded;
use crate::codecs::CodecRegistry;
use crate::config::Config;
use crate::crypto::init_crypto_provider;
use crate::errors::{Error, Result};
use crate::event::Event;
use crate::harvester::{Harvester, HarvesterHandle, Source};
use crate::prospector::Prospector;
use crate::publisher::Publisher;
use crate::registrar::Registrar;
use crate::spooler::Spooler;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wait::TaskSet;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const SOURCES_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRAR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-reads the configuration file and publishes it to the running pipeline.
#[derive(Clone)]
pub struct Reloader {
    path: Option<PathBuf>,
    registry: CodecRegistry,
    tx: Arc<watch::Sender<Arc<Config>>>,
}

impl Reloader {
    pub fn new(config: Config, path: Option<PathBuf>, registry: CodecRegistry) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self {
            path,
            registry,
            tx: Arc::new(tx),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// On failure the running configuration stays in place.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Err(Error::Config(
                "configuration was not loaded from a file".to_string(),
            ));
        };
        let config = Config::load(path, &self.registry)?;
        self.tx.send_replace(Arc::new(config));
        info!(path = %path.display(), "Configuration reloaded");
        Ok(())
    }
}

pub struct Agent {
    reloader: Reloader,
    from_beginning: bool,
    stdin: bool,
    admin: Arc<Node>,
}

impl Agent {
    pub fn new(reloader: Reloader) -> Self {
        Self {
            reloader,
            from_beginning: false,
            stdin: false,
            admin: Arc::new(Node::new()),
        }
    }

    /// Read files found on the first scan from the start instead of tailing.
    pub fn with_from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }

    /// Harvest standard input instead of the configured files.
    pub fn with_stdin(mut self, stdin: bool) -> Self {
        self.stdin = stdin;
        self
    }

    /// Root of the admin tree, populated once [`Agent::run`] starts.
    pub fn admin(&self) -> Arc<Node> {
        self.admin.clone()
    }

    pub async fn run(self, agent_cancel: CancellationToken) -> std::result::Result<(), BoxError> {
        let config = self.reloader.current();
        info!(version = env!("CARGO_PKG_VERSION"), "Starting log-courier");

        // Initialize the TLS library
        init_crypto_provider()?;

        let mut sources = TaskSet::new();
        let mut pipeline = TaskSet::new();
        let mut registrar_task = TaskSet::new();

        let sources_cancel = CancellationToken::new();
        let pipeline_cancel = CancellationToken::new();

        let (spool_tx, spool_rx) = bounded::<Option<Event>>(config.general.spool_size.max(1));
        let (publish_tx, publish_rx) =
            bounded::<Vec<Event>>(config.network.max_pending_payloads.max(1));

        let mut registrar = if self.stdin {
            Registrar::without_persistence()
        } else {
            Registrar::new(&config.general.persist_dir)
        };

        let harvesters = Arc::new(Node::new());
        if self.stdin {
            let handle = Harvester::new(
                Source::Stdin,
                Arc::new(config.stdin.clone()),
                Arc::new(config.general.clone()),
                0,
                spool_tx,
            )
            .spawn();
            harvesters.set_entry("stdin", Arc::new(handle.snapshot_entry()));

            let cancel = sources_cancel.clone();
            sources.spawn(async move { watch_stdin(handle, cancel).await.map_err(BoxError::from) });
        } else {
            let prospector = Prospector::new(
                &mut registrar,
                self.reloader.subscribe(),
                spool_tx,
                self.from_beginning,
            )?;
            self.admin
                .set_entry("prospector", Arc::new(prospector.admin_node()));
            harvesters.set_entry("files", Arc::new(prospector.harvesters_entry()));

            let cancel = sources_cancel.clone();
            sources.spawn(async move { prospector.run(cancel).await.map_err(BoxError::from) });
        }
        self.admin.set_entry("harvesters", harvesters);

        let registrar_spool = registrar.connect().ok_or(Error::Shutdown)?;
        let publisher = Publisher::new(publish_rx, registrar_spool, self.reloader.subscribe())?;
        self.admin
            .set_entry("publisher", Arc::new(publisher.snapshot_entry()));

        let reloader = self.reloader.clone();
        self.admin.set_entry(
            "reload",
            Arc::new(CallbackEntry::new(move |_| {
                reloader
                    .reload()
                    .map(|_| "Configuration reloaded".to_string())
                    .map_err(|e| ApiError::Failed(e.to_string()))
            })),
        );

        let spooler = Spooler::new(spool_rx, publish_tx, self.reloader.subscribe());

        let cancel = pipeline_cancel.clone();
        pipeline.spawn(async move { spooler.run(cancel).await.map_err(BoxError::from) });
        let cancel = pipeline_cancel.clone();
        pipeline.spawn(async move { publisher.run(cancel).await.map_err(BoxError::from) });

        registrar_task.spawn(async move { registrar.run().await.map_err(BoxError::from) });

        let mut result = Ok(());
        let mut stdin_done = false;
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled");
            }
            e = wait::wait_for_any_task(&mut sources) => match e {
                Ok(()) if self.stdin => stdin_done = true,
                Ok(()) => warn!("Unexpected early exit of prospector"),
                Err(e) => result = Err(e),
            },
            e = wait::wait_for_any_task(&mut pipeline) => match e {
                Ok(()) => warn!("Unexpected early exit of pipeline"),
                Err(e) => result = Err(e),
            },
            e = wait::wait_for_any_task(&mut registrar_task) => match e {
                Ok(()) => warn!("Unexpected early exit of registrar"),
                Err(e) => result = Err(e),
            },
        }

        if stdin_done {
            info!("End of input reached, waiting for outstanding events to be acknowledged");
            select! {
                _ = agent_cancel.cancelled() => {
                    debug!("Agent cancellation signaled");
                }
                e = wait::wait_for_all_tasks(&mut pipeline) => {
                    if let Err(e) = e {
                        result = Err(e);
                    }
                }
            }
        }

        if let Err(e) = &result {
            error!(error = %e, "Pipeline failed, shutting down");
        }

        // Step one, stop the harvesters so nothing new enters the pipeline.
        sources_cancel.cancel();
        let sources_stopped =
            wait::wait_for_tasks_with_timeout(&mut sources, SOURCES_STOP_TIMEOUT).await;
        if let Err(e) = &sources_stopped {
            warn!(error = %e, "Harvesters did not stop, cancelling pipeline regardless");
        }

        // Step two, the publisher waits up to the network timeout for
        // outstanding acknowledgements.
        pipeline_cancel.cancel();
        let grace = config.network.timeout + Duration::from_secs(1);
        if let Err(e) = wait::wait_for_tasks_with_timeout(&mut pipeline, grace).await {
            return Err(format!("timed out waiting for pipeline to exit: {}", e).into());
        }

        // With the spooler gone, blocked harvesters see their output close.
        if sources_stopped.is_err() {
            if let Err(e) =
                wait::wait_for_tasks_with_timeout(&mut sources, Duration::from_secs(1)).await
            {
                return Err(format!("timed out waiting for harvesters to exit: {}", e).into());
            }
        }

        // Every registrar client has dropped its spool, the registrar
        // persists and exits.
        if let Err(e) =
            wait::wait_for_tasks_with_timeout(&mut registrar_task, REGISTRAR_STOP_TIMEOUT).await
        {
            return Err(format!("timed out waiting for registrar to exit: {}", e).into());
        }

        info!("Shutdown complete");
        result
    }
}

async fn watch_stdin(mut handle: HarvesterHandle, cancel: CancellationToken) -> Result<()> {
    let finish = select! {
        finish = handle.wait() => Some(finish),
        _ = cancel.cancelled() => None,
    };
    let finish = match finish {
        Some(finish) => finish,
        None => {
            handle.stop();
            handle.wait().await
        }
    };
    info!(offset = finish.offset, "Stdin harvester finished");
    finish.result
}

/// Loads and validates a configuration file, used by `--config-test`.
pub fn test_config(path: &Path, registry: &CodecRegistry) -> Result<Config> {
    let config = Config::load(path, registry)?;
    debug!(files = config.files.len(), "Configuration is valid");
    Ok(config)
}
