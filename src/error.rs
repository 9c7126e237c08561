//! Error taxonomy for the knowledge store and sync engine
//!
//! Parsing never fails, so there is no parse error here. Duplicate problems
//! are reported as a normal [`crate::board::PostOutcome`], not an error.

use std::path::PathBuf;

/// Errors surfaced by the store, board and tool layer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage failure at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {path} is corrupt: {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("snapshot version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),
}

/// Failures talking to the remote collective store.
///
/// Never shown to tool callers; recorded and retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected (HTTP {0})")]
    Auth(u16),

    #[error("remote unavailable (HTTP {0})")]
    Unavailable(u16),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Classify an HTTP status code the way the remote reports failures
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => SyncError::Auth(status),
            408 => SyncError::Timeout(std::time::Duration::ZERO),
            429 | 500..=599 => SyncError::Unavailable(status),
            _ => SyncError::Protocol(format!("HTTP {}: {}", status, truncate(body, 200))),
        }
    }

    /// Whether retrying later could succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, SyncError::Protocol(_))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
