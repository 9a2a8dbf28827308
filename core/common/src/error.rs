//! Common error types for PrepSync.

use thiserror::Error;

/// Top-level error type for PrepSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote store unreachable (timeouts, connection resets, offline).
    #[error("Network error: {0}")]
    Network(String),

    /// Remote store rejected the request.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Local storage operation failed (quota, corrupt row, ...).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Local storage engine could not be opened at all.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided by a caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the sync queue should retry an operation that failed with this error.
    ///
    /// Contract violations are never retried: repeating a call with the same
    /// bad input cannot succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Remote(_) | Error::Io(_) | Error::StorageUnavailable(_)
        )
    }

    /// Whether this error indicates a caller bug.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::InvalidInput(_) | Error::NotPermitted(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
