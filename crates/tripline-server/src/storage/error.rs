//! Storage error types.

use thiserror::Error;

/// Errors from storage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Underlying I/O or database failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Append with a non-sequential message id. Means the caller's cached
    /// next id drifted from the persisted log.
    #[error("message id conflict: expected {expected}, got {got}")]
    Conflict {
        /// Next id the log expects
        expected: u64,
        /// Id the caller tried to append
        got: u64,
    },
}
