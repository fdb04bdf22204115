// SPDX-License-Identifier: Apache-2.0

//! Persisted per-file state.
//!
//! The state file maps each tracked path to its source, resume offset and
//! identity. Writes go to `.log-courier.new` which is fsynced and then renamed
//! over `.log-courier`, so a crash leaves either the previous or the new state
//! on disk and never a partial file.

use crate::errors::{Error, Result};
use crate::harvester::FileId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const STATE_FILE_NAME: &str = ".log-courier";
pub const STATE_FILE_NEW_NAME: &str = ".log-courier.new";

/// Identity fields as written to the state file.
#[cfg(not(windows))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIdentity {
    pub inode: u64,
    pub device: u64,
}

#[cfg(not(windows))]
impl From<FileId> for PersistedIdentity {
    fn from(id: FileId) -> Self {
        Self {
            inode: id.ino(),
            device: id.dev(),
        }
    }
}

#[cfg(not(windows))]
impl From<PersistedIdentity> for FileId {
    fn from(identity: PersistedIdentity) -> Self {
        FileId::new(identity.device, identity.inode)
    }
}

/// Identity fields as written to the state file.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIdentity {
    pub vol: u32,
    pub idxhi: u32,
    pub idxlo: u32,
}

#[cfg(windows)]
impl From<FileId> for PersistedIdentity {
    fn from(id: FileId) -> Self {
        Self {
            vol: id.dev() as u32,
            idxhi: (id.ino() >> 32) as u32,
            idxlo: id.ino() as u32,
        }
    }
}

#[cfg(windows)]
impl From<PersistedIdentity> for FileId {
    fn from(identity: PersistedIdentity) -> Self {
        FileId::new(
            identity.vol as u64,
            ((identity.idxhi as u64) << 32) | identity.idxlo as u64,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub offset: i64,
    #[serde(flatten)]
    pub identity: PersistedIdentity,
}

/// A [`FileState`] together with the path it was last seen at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub source: String,
    #[serde(flatten)]
    pub state: FileState,
}

impl PersistedState {
    pub fn new(source: impl Into<String>, offset: i64, id: FileId) -> Self {
        Self {
            source: source.into(),
            state: FileState {
                offset,
                identity: id.into(),
            },
        }
    }

    pub fn file_id(&self) -> FileId {
        self.state.identity.into()
    }

    pub fn offset(&self) -> i64 {
        self.state.offset
    }
}

pub type StateMap = BTreeMap<String, PersistedState>;

/// Location of the state file and its pending replacement.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    new_path: PathBuf,
}

impl StateFile {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            path: dir.join(STATE_FILE_NAME),
            new_path: dir.join(STATE_FILE_NEW_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state file, falling back to the pending `.new` file when the
    /// rename of a previous write did not complete. `None` if neither exists.
    pub fn load(&self) -> Result<Option<StateMap>> {
        for path in [&self.path, &self.new_path] {
            let file = match File::open(path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Persistence(format!(
                        "failed to open {}: {}",
                        path.display(),
                        e
                    )));
                }
            };

            let states = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                Error::Persistence(format!("failed to parse {}: {}", path.display(), e))
            })?;
            return Ok(Some(states));
        }
        Ok(None)
    }

    pub fn save(&self, states: &StateMap) -> Result<()> {
        let file = File::create(&self.new_path).map_err(|e| {
            Error::Persistence(format!(
                "failed to create {}: {}",
                self.new_path.display(),
                e
            ))
        })?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, states)
            .map_err(|e| Error::Persistence(format!("failed to encode state: {}", e)))?;
        writer
            .flush()
            .map_err(|e| Error::Persistence(format!("failed to flush state: {}", e)))?;

        let file = writer
            .into_inner()
            .map_err(|e| Error::Persistence(format!("failed to flush state: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::Persistence(format!("failed to sync state: {}", e)))?;
        drop(file);

        fs::rename(&self.new_path, &self.path).map_err(|e| {
            Error::Persistence(format!(
                "failed to rename {} to {}: {}",
                self.new_path.display(),
                self.path.display(),
                e
            ))
        })
    }
}
