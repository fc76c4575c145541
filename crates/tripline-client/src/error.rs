//! Client error types.

use thiserror::Error;
use tripline_core::TripId;

/// Errors from client state machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Operation requires a joined trip room.
    #[error("not joined to trip {trip_id}")]
    NotJoined {
        /// Trip that was not joined
        trip_id: TripId,
    },

    /// Message body is empty after trimming.
    #[error("message body is empty")]
    EmptyBody,

    /// Message body exceeds the protocol limit.
    #[error("message body exceeds {limit} bytes")]
    BodyTooLong {
        /// The enforced limit
        limit: usize,
    },

    /// Resend requested for an unknown or non-failed message.
    #[error("no failed message with correlation id {correlation_id:#x}")]
    UnknownMessage {
        /// Correlation id that matched nothing
        correlation_id: u128,
    },

    /// Received a frame that could not be understood.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with it
        reason: String,
    },
}
