//! Common error types for Deferq.

use thiserror::Error;

/// Top-level error type for queue, storage and replay operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The durable store could not be written (unavailable, quota exceeded).
    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    /// The durable store could not be read.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A replay run is already in progress.
    #[error("Replay already in progress")]
    ReplayInProgress,

    /// The referenced conflict is not pending (never existed or already resolved).
    #[error("Unknown conflict: {0}")]
    UnknownConflict(String),

    /// A single delivery attempt failed without a version conflict.
    #[error("Transient delivery failure: {0}")]
    TransientDelivery(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether the error is worth retrying against the same endpoint.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientDelivery(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
