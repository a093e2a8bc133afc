//! Error taxonomy for the sync agent.
//!
//! Every failure the core can surface maps onto one variant here. Per-file
//! failures are logged and counted by the orchestrator; only validation and
//! persistence errors are returned to callers of the folder-management API.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A folder definition was rejected (bad path, duplicate path, bad id).
    #[error("invalid folder: {0}")]
    Validation(String),

    /// The OS notification source could not be created.
    #[error("failed to create file watcher: {0}")]
    WatcherInit(String),

    /// The OS-level watch could not be registered for a path.
    #[error("failed to watch {path}: {reason}")]
    WatchRegistration { path: PathBuf, reason: String },

    /// The upload queue is at capacity; the task was not accepted.
    #[error("upload queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// A single upload attempt failed.
    #[error("upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },

    /// Listing the remote namespace failed.
    #[error("failed to list remote prefix '{prefix}': {reason}")]
    RemoteList { prefix: String, reason: String },

    /// Downloading a remote object failed.
    #[error("failed to download {key}: {reason}")]
    Download { key: String, reason: String },

    /// The configuration could not be written back.
    #[error("failed to persist configuration: {0}")]
    ConfigPersist(String),

    /// The configuration is malformed or names an unknown provider.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("folder {0} does not exist")]
    FolderNotFound(String),

    #[error("a full sync is already in progress")]
    SyncInProgress,

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// True for errors that the caller caused and that left state untouched.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
