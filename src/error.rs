//! Error taxonomy for the offline sales engine.
//!
//! Local write failures surface as [`StoreError`], per-entry replay failures
//! as [`RemoteError`], and runtime-level calls combine both in [`SyncError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialize value for key {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("local store lock poisoned")]
    Poisoned,

    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote service is not configured")]
    NotConfigured,

    #[error("cannot reach remote service at {0}")]
    Unreachable(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("invalid JSON from remote service: {0}")]
    InvalidBody(String),

    #[error("network error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("device is offline")]
    Offline,

    #[error("sync loop is already running")]
    AlreadyRunning,
}

pub type StoreResult<T> = Result<T, StoreError>;
