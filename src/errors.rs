// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unused configuration key at {path}: {key}")]
    UnusedConfig { path: String, key: String },

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Invalid pattern {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("File identity changed before harvest could begin: {0}")]
    IdentityMismatch(PathBuf),

    #[error("Event of {size} bytes exceeds the spool max bytes of {max}")]
    EventTooLarge { size: usize, max: usize },

    #[error("Channel send error")]
    ChannelSend,

    #[error("Shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
