//! Client events and actions.
//!
//! The caller is responsible for receiving frames from the network,
//! driving time forward via ticks, and forwarding application intents
//! (send message, join trip, request history).
//!
//! Generic over `I` (instant type) to support both production
//! (`std::time::Instant`) and test environments.

use tripline_core::TripId;
use tripline_proto::Frame;

/// Events the caller feeds into the client.
#[derive(Debug, Clone)]
pub enum ClientEvent<I = std::time::Instant> {
    /// Transport is established; the client should authenticate.
    Connected,

    /// Frame received from the server.
    FrameReceived(Frame),

    /// Time tick for pending-message timeout processing.
    ///
    /// The caller should send ticks periodically so sends whose echo never
    /// arrives eventually fail instead of pending forever.
    Tick {
        /// Current time from the environment.
        now: I,
    },

    /// Application wants to join a trip's chat room.
    JoinTrip {
        /// Trip to join.
        trip_id: TripId,
    },

    /// Application wants to leave a trip's chat room.
    LeaveTrip {
        /// Trip to leave.
        trip_id: TripId,
    },

    /// Application wants to send a message.
    SendMessage {
        /// Target trip.
        trip_id: TripId,
        /// Message body.
        body: String,
    },

    /// Application wants to resend a failed message.
    ///
    /// The stored body is reused, as is the original correlation id, so a
    /// duplicate commit of the first attempt still collapses into one
    /// visible entry.
    ResendMessage {
        /// Trip the message belongs to.
        trip_id: TripId,
        /// Correlation id of the failed message.
        correlation_id: u128,
    },

    /// Application wants the persisted history for a trip.
    RequestHistory {
        /// Trip to load.
        trip_id: TripId,
    },

    /// Application wants to register the user as a trip participant.
    ///
    /// Idempotent on the server; registering twice is a no-op success.
    RegisterParticipant {
        /// Trip to register for.
        trip_id: TripId,
    },

    /// The transport reported that a send could not be delivered.
    SendFailed {
        /// Trip the message belongs to.
        trip_id: TripId,
        /// Correlation id of the doomed message.
        correlation_id: u128,
        /// Transport-level reason.
        reason: String,
    },
}

/// Actions the client produces for the caller to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Send a frame to the server.
    Send(Frame),

    /// A conversation's message list changed; re-render it.
    ConversationUpdated {
        /// Trip whose conversation changed.
        trip_id: TripId,
    },

    /// Log message for debugging.
    Log {
        /// Log message.
        message: String,
    },
}
