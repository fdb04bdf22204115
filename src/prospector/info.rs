// SPDX-License-Identifier: Apache-2.0

use crate::admin::{KeyValue, Value as ApiValue};
use crate::event::StreamKey;
use crate::harvester::{FileId, FileStat, HarvesterFinish, HarvesterHandle};
use crate::registrar::PersistedState;
use crate::util::ExpBackoff;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;

const FAILED_BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Loaded from the state file, not yet harvested this run.
    Resume,
    /// The last harvester exited with an error.
    Failed,
    /// Placeholder for a path that could not be prospected.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Orphaned {
    No,
    /// The path no longer leads to this file, a deletion is about to be
    /// reported.
    Maybe,
    /// Deletion reported, kept only until the harvester has stopped.
    Yes,
}

/// Why a path has an invalid placeholder entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProspectError {
    /// Expected condition, logged at info level.
    Skip(&'static str),
    Stat(String),
}

impl ProspectError {
    pub const DIRECTORY: ProspectError = ProspectError::Skip("Directory");
    pub const DUPLICATE: ProspectError = ProspectError::Skip("Duplicate");
}

impl fmt::Display for ProspectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProspectError::Skip(reason) => write!(f, "{}", reason),
            ProspectError::Stat(message) => write!(f, "{}", message),
        }
    }
}

/// Everything the prospector knows about one tracked file.
pub struct ProspectorInfo {
    pub key: StreamKey,
    pub path: PathBuf,
    pub id: FileId,
    /// The most recent stat, from a scan or from the last harvester.
    pub stat: Option<FileStat>,
    pub last_seen: u32,
    pub status: Status,
    pub orphaned: Orphaned,
    /// Where the next harvester starts.
    pub finish_offset: i64,
    harvester: Option<HarvesterHandle>,
    error: Option<String>,
    invalid: Option<ProspectError>,
    backoff: ExpBackoff,
    failed_until: Option<Instant>,
}

impl ProspectorInfo {
    fn build(key: StreamKey, path: PathBuf, id: FileId, status: Status) -> Self {
        Self {
            key,
            path,
            id,
            stat: None,
            last_seen: 0,
            status,
            orphaned: Orphaned::No,
            finish_offset: 0,
            harvester: None,
            error: None,
            invalid: None,
            backoff: ExpBackoff::new(FAILED_BACKOFF_BASE),
            failed_until: None,
        }
    }

    pub fn from_state(key: StreamKey, path: impl Into<PathBuf>, state: &PersistedState) -> Self {
        let mut info = Self::build(key, path.into(), state.file_id(), Status::Resume);
        info.finish_offset = state.offset();
        info
    }

    pub fn from_stat(key: StreamKey, path: PathBuf, stat: FileStat) -> Self {
        let mut info = Self::build(key, path, stat.id, Status::Ok);
        info.stat = Some(stat);
        info
    }

    pub fn invalid(key: StreamKey, path: PathBuf, error: ProspectError) -> Self {
        let mut info = Self::build(key, path, FileId::default(), Status::Invalid);
        info.error = Some(error.to_string());
        info.invalid = Some(error);
        info
    }

    pub fn invalid_reason(&self) -> Option<&ProspectError> {
        self.invalid.as_ref()
    }

    pub fn seen_in(&self, iteration: u32) -> bool {
        self.last_seen == iteration
    }

    pub fn update(&mut self, stat: Option<FileStat>, iteration: u32) {
        if let Some(stat) = stat {
            self.id = stat.id;
            self.stat = Some(stat);
        }
        self.last_seen = iteration;
    }

    pub fn set_harvester(&mut self, harvester: HarvesterHandle) {
        self.harvester = Some(harvester);
        self.status = Status::Ok;
    }

    pub fn harvester(&self) -> Option<&HarvesterHandle> {
        self.harvester.as_ref()
    }

    /// Whether a harvester is active, collecting its result if it has exited.
    pub fn is_running(&mut self) -> bool {
        let finish = match self.harvester.as_mut() {
            Some(harvester) => harvester.try_finish(),
            None => return false,
        };
        if let Some(finish) = finish {
            self.set_stopped(finish);
        }
        self.harvester.is_some()
    }

    pub fn stop(&mut self) {
        if let Some(harvester) = self.harvester.as_mut() {
            harvester.stop();
        }
    }

    pub fn take_harvester(&mut self) -> Option<HarvesterHandle> {
        self.harvester.take()
    }

    /// Failed entries wait out their backoff before being retried.
    pub fn can_restart_failed(&self) -> bool {
        if self.status != Status::Failed {
            return true;
        }
        self.failed_until
            .is_none_or(|until| Instant::now() >= until)
    }

    pub fn set_stopped(&mut self, finish: HarvesterFinish) {
        self.harvester = None;
        // Resume from the last complete event rather than the last read, so
        // a multiline codec sees whole events again.
        self.finish_offset = finish.offset;

        match finish.result {
            Ok(()) => {
                self.backoff.reset();
                self.failed_until = None;
            }
            Err(e) => {
                let delay = self.backoff.trigger();
                debug!(path = %self.path.display(), ?delay, "Harvester failed, delaying restart");
                self.status = Status::Failed;
                self.error = Some(e.to_string());
                self.failed_until = Some(Instant::now() + delay);
            }
        }

        if let Some(stat) = finish.stat {
            self.stat = Some(stat);
        }
    }

    pub fn snapshot(&self) -> KeyValue {
        let orphaned = match self.orphaned {
            Orphaned::No => "no",
            Orphaned::Maybe => "maybe",
            Orphaned::Yes => "yes",
        };

        let status = match self.status {
            Status::Ok if self.harvester.is_some() => "running".to_string(),
            Status::Ok => "dead".to_string(),
            Status::Resume => "resuming".to_string(),
            Status::Failed => match self.failed_until {
                Some(until) => {
                    let retry = chrono::Utc::now()
                        + until.saturating_duration_since(Instant::now());
                    format!("failed (retry at {})", retry.to_rfc3339())
                }
                None => "failed".to_string(),
            },
            Status::Invalid => match self.invalid {
                Some(ProspectError::Skip(_)) => "skipped".to_string(),
                _ => "error".to_string(),
            },
        };

        let error = match (&self.status, &self.error) {
            (Status::Failed | Status::Invalid, Some(error)) => ApiValue::String(error.clone()),
            _ => ApiValue::Null,
        };

        let mut snapshot = KeyValue::new()
            .with("id", self.key.to_string())
            .with("path", self.path.display().to_string())
            .with("type", "file")
            .with("orphaned", orphaned)
            .with("status", status)
            .with("error", error);
        if let Some(harvester) = &self.harvester {
            snapshot.set("harvester", harvester.snapshot());
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    fn finish(offset: i64, result: crate::errors::Result<()>) -> HarvesterFinish {
        HarvesterFinish {
            offset,
            result,
            stat: None,
        }
    }

    #[test]
    fn loaded_state_resumes_at_saved_offset() {
        let state = PersistedState::new("/x.log", 42, FileId::new(1, 2));
        let info = ProspectorInfo::from_state(StreamKey::new(1), "/x.log", &state);
        assert_eq!(Status::Resume, info.status);
        assert_eq!(42, info.finish_offset);
        assert_eq!(FileId::new(1, 2), info.id);
        assert_eq!(
            Some(&ApiValue::from("resuming")),
            info.snapshot().get("status")
        );
    }

    #[test]
    fn failure_delays_restart_until_success() {
        let mut info =
            ProspectorInfo::invalid(StreamKey::new(3), "/x.log".into(), ProspectError::DIRECTORY);
        info.status = Status::Ok;

        info.set_stopped(finish(10, Err(Error::Shutdown)));
        assert_eq!(Status::Failed, info.status);
        assert_eq!(10, info.finish_offset);
        assert!(!info.can_restart_failed());

        let snapshot = info.snapshot();
        let Some(ApiValue::String(status)) = snapshot.get("status") else {
            panic!("missing status");
        };
        assert!(status.starts_with("failed (retry at "));
        assert_eq!(
            Some(&ApiValue::from(Error::Shutdown.to_string())),
            snapshot.get("error")
        );

        info.failed_until = Some(Instant::now());
        assert!(info.can_restart_failed());

        info.status = Status::Ok;
        info.set_stopped(finish(20, Ok(())));
        assert!(info.can_restart_failed());
        assert_eq!(20, info.finish_offset);
    }

    #[test]
    fn invalid_entries_report_their_reason() {
        let skipped =
            ProspectorInfo::invalid(StreamKey::new(1), "/d".into(), ProspectError::DIRECTORY);
        let snapshot = skipped.snapshot();
        assert_eq!(Some(&ApiValue::from("skipped")), snapshot.get("status"));
        assert_eq!(Some(&ApiValue::from("Directory")), snapshot.get("error"));

        let failed = ProspectorInfo::invalid(
            StreamKey::new(2),
            "/e".into(),
            ProspectError::Stat("permission denied".to_string()),
        );
        assert_eq!(Some(&ApiValue::from("error")), failed.snapshot().get("status"));
        assert_eq!(Some(&ProspectError::DUPLICATE), Some(&ProspectError::Skip("Duplicate")));
    }
}
