//! Driver error types.
//!
//! Errors returned by [`crate::ServerDriver`] itself. Note the asymmetry
//! with the live-channel error frames: authorization, validation, and
//! storage failures are terminal for one operation only and surface as
//! sender-only error frames, not as values of this type.

use std::fmt;

use crate::storage::StorageError;

/// Errors that can occur during driver event processing.
#[derive(Debug)]
pub enum ServerError {
    /// Session not found in the registry.
    ///
    /// Occurs when an event references a session that was never accepted or
    /// was already closed. May be transient around disconnects.
    SessionNotFound(u64),

    /// Storage operation failed outside a per-operation path.
    ///
    /// See `StorageError` for details. May be transient (I/O) or fatal
    /// (corruption).
    Storage(StorageError),

    /// Frame encoding/decoding error.
    ///
    /// Indicates a protocol violation or a bug; fatal for that frame.
    Protocol(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<tripline_proto::ProtocolError> for ServerError {
    fn from(err: tripline_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
