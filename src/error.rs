//! Error types shared by the supervisor and the aggregator

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while supervising, sampling or aggregating
#[derive(Error, Debug)]
pub enum EmuError {
    #[error("can't read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("can't write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command array is empty")]
    EmptyCommand,

    #[error("node value parse error in '{record}'")]
    NodeRecord { record: String },

    #[error("invalid size '{0}'")]
    InvalidSize(String),

    #[error("invalid node list '{0}'")]
    InvalidNodeList(String),

    #[error("node {0} is outside the supported placement mask")]
    NodeOutOfRange(u32),

    #[error("only {available} bytes free on node {node}, budget is {budget}")]
    InsufficientNearMemory { node: u32, available: u64, budget: u64 },

    #[error("{call} failed: {errno}")]
    Os {
        call: &'static str,
        #[source]
        errno: nix::errno::Errno,
    },

    #[error("unexpected readiness token {0}")]
    UnexpectedEvent(u64),

    #[error("reading sync line of '{source_id}': got '{line}'")]
    SyncLine { source_id: String, line: String },

    #[error("no input stream {0}")]
    NoSuchStream(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EmuError {
    /// Wrap an errno from a named OS call
    pub fn os(call: &'static str, errno: nix::errno::Errno) -> Self {
        EmuError::Os { call, errno }
    }
}

/// Result type for library operations
pub type Result<T> = std::result::Result<T, EmuError>;
