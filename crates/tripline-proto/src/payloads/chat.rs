//! Chat payload types.
//!
//! [`ChatMessage`] is the committed record: immutable and append-only. There
//! is deliberately no edit or delete payload anywhere in the protocol.

use serde::{Deserialize, Serialize};

/// Maximum message body length in bytes, enforced before persistence.
///
/// Keeps a full history page well under the frame payload limit.
pub const MAX_BODY_LEN: usize = 4096;

/// A committed chat message.
///
/// The id is server-assigned, monotonically increasing per trip, and fixes
/// the message's position in history. Broadcast order follows commit order,
/// so every member that sees this record live also finds it at the same
/// position on the next history load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Per-trip monotonic message id (starts at 1).
    pub id: u64,

    /// Trip the message belongs to.
    pub trip_id: u64,

    /// Stable id of the authoring user.
    pub author_id: u64,

    /// Author display name at commit time.
    pub author_name: String,

    /// Message body (trimmed once by the server).
    pub body: String,

    /// Commit timestamp, Unix milliseconds.
    pub created_at_ms: u64,
}

/// Send a message into a trip room.
///
/// The trip id and the client-generated correlation id travel in the frame
/// header; the payload is just the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    /// Message body.
    pub body: String,
}

/// Broadcast of a committed message to every room member, the sender
/// included. The sender's echo carries the original correlation id in the
/// frame header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// The committed record.
    pub message: ChatMessage,
}

/// Request a page of persisted messages, ascending by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// First message id to return (inclusive; ids start at 1).
    pub from_id: u64,

    /// Maximum number of messages to return.
    pub limit: u32,
}

/// Ordered page of persisted messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Messages in ascending id order.
    pub messages: Vec<ChatMessage>,

    /// Whether messages beyond this page exist.
    pub has_more: bool,
}

/// Persist a message without a live broadcast.
///
/// Fallback path for clients without a live room subscription; other
/// members see the message on their next history load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessage {
    /// Message body.
    pub body: String,
}

/// Reply to [`PostMessage`] carrying the created record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostAck {
    /// The committed record.
    pub message: ChatMessage,
}

/// Reply to a participant registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    /// True if a new registration was created, false if the caller was
    /// already registered (repeat registration is a no-op success).
    pub created: bool,
}
