//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary for cheap routing, but payloads use CBOR for
//! type safety and forward compatibility. The [`Payload`] enum is the closed
//! set of message types: session management, live chat, and the
//! request/response endpoints (history, offline post, participant
//! registration).
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). The variant tag is never serialized: the frame header's
//! opcode already identifies the payload type, which also prevents
//! mismatched opcode/payload pairs. Round-trip encoding must produce
//! identical values.

pub mod chat;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Session management
    /// Handshake carrying the signed session credential
    Hello(session::Hello),
    /// Server reply to a successful handshake
    HelloAck(session::HelloAck),
    /// Graceful disconnect
    Goodbye(session::Goodbye),

    // Live chat
    /// Subscribe to a trip room (trip id in the header, zero-byte payload)
    JoinTrip,
    /// Unsubscribe from a trip room (zero-byte payload)
    LeaveTrip,
    /// Send a message into a trip room
    SendMessage(chat::SendMessage),
    /// Broadcast of a committed message
    NewMessage(chat::NewMessage),

    // Request/response endpoints
    /// Request a page of persisted messages
    HistoryRequest(chat::HistoryRequest),
    /// Ordered page of persisted messages
    HistoryResponse(chat::HistoryResponse),
    /// Persist a message without live broadcast
    PostMessage(chat::PostMessage),
    /// Record created by `PostMessage`
    PostAck(chat::PostAck),
    /// Register the caller as a trip participant (zero-byte payload)
    RegisterParticipant,
    /// Registration outcome
    RegisterAck(chat::RegisterAck),

    // Error frame
    /// Error response
    Error(ErrorPayload),
}

/// Error payload for error frames.
///
/// Delivered to the affected session only; errors are terminal for the
/// single operation and never tear down other members' state. When the
/// error dooms a specific send, the frame header carries the doomed
/// message's correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorPayload {
    /// Missing, malformed, expired, or forged session credential.
    pub const AUTHENTICATION: u16 = 0x0001;
    /// Valid identity, insufficient trip membership.
    pub const AUTHORIZATION: u16 = 0x0002;
    /// Rejected before persistence (empty body, malformed payload).
    pub const VALIDATION: u16 = 0x0003;
    /// Persistence failure; the message was never broadcast.
    pub const STORAGE: u16 = 0x0004;
    /// Trip does not exist.
    pub const NOT_FOUND: u16 = 0x0005;
    /// Malformed frame or unexpected opcode.
    pub const PROTOCOL: u16 = 0x0006;

    /// Create an authentication error.
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self { code: Self::AUTHENTICATION, message: msg.into() }
    }

    /// Create an authorization error.
    pub fn authorization(msg: impl Into<String>) -> Self {
        Self { code: Self::AUTHORIZATION, message: msg.into() }
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self { code: Self::VALIDATION, message: msg.into() }
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self { code: Self::STORAGE, message: msg.into() }
    }

    /// Create a trip-not-found error.
    pub fn not_found(trip_id: u64) -> Self {
        Self { code: Self::NOT_FOUND, message: format!("trip not found: {trip_id}") }
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self { code: Self::PROTOCOL, message: msg.into() }
    }
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::HelloAck(_) => Opcode::HelloAck,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::JoinTrip => Opcode::JoinTrip,
            Self::LeaveTrip => Opcode::LeaveTrip,
            Self::SendMessage(_) => Opcode::SendMessage,
            Self::NewMessage(_) => Opcode::NewMessage,
            Self::HistoryRequest(_) => Opcode::HistoryRequest,
            Self::HistoryResponse(_) => Opcode::HistoryResponse,
            Self::PostMessage(_) => Opcode::PostMessage,
            Self::PostAck(_) => Opcode::PostAck,
            Self::RegisterParticipant => Opcode::RegisterParticipant,
            Self::RegisterAck(_) => Opcode::RegisterAck,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Encode the payload to a buffer.
    ///
    /// Serializes only the inner struct, NOT the variant tag; the frame
    /// header's opcode already identifies the payload type. CBOR encoding is
    /// deterministic, so equal payloads produce equal bytes.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CborEncode`] if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloAck(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::JoinTrip | Self::LeaveTrip | Self::RegisterParticipant => Ok(()), // Zero-byte payloads
            Self::SendMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::NewMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HistoryRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HistoryResponse(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::PostMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::PostAck(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RegisterAck(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode a payload from bytes based on the opcode.
    ///
    /// The size check runs before CBOR parsing begins, so the parser never
    /// sees maliciously large inputs. Unknown opcodes are rejected rather
    /// than silently ignored.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PayloadTooLarge`] if bytes exceed the size limit
    /// - [`ProtocolError::CborDecode`] if deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        fn read<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
        }

        let payload = match opcode {
            Opcode::Hello => Self::Hello(read(bytes)?),
            Opcode::HelloAck => Self::HelloAck(read(bytes)?),
            Opcode::Goodbye => Self::Goodbye(read(bytes)?),
            Opcode::JoinTrip => Self::JoinTrip,
            Opcode::LeaveTrip => Self::LeaveTrip,
            Opcode::SendMessage => Self::SendMessage(read(bytes)?),
            Opcode::NewMessage => Self::NewMessage(read(bytes)?),
            Opcode::HistoryRequest => Self::HistoryRequest(read(bytes)?),
            Opcode::HistoryResponse => Self::HistoryResponse(read(bytes)?),
            Opcode::PostMessage => Self::PostMessage(read(bytes)?),
            Opcode::PostAck => Self::PostAck(read(bytes)?),
            Opcode::RegisterParticipant => Self::RegisterParticipant,
            Opcode::RegisterAck => Self::RegisterAck(read(bytes)?),
            Opcode::Error => Self::Error(read(bytes)?),
        };

        Ok(payload)
    }

    /// Convert the payload into a transport frame.
    ///
    /// Encodes to CBOR, stamps the correct opcode into the header, and sets
    /// `payload_size` automatically.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CborEncode`] if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Parse a payload from a raw transport frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CborDecode`] if the opcode is invalid or
    ///   deserialization fails
    /// - [`ProtocolError::PayloadTooLarge`] if the payload exceeds the limit
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame.header.opcode_enum().ok_or_else(|| {
            ProtocolError::CborDecode(format!("invalid opcode: {:#06x}", frame.header.opcode()))
        })?;
        Self::decode(opcode, &frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::chat::{ChatMessage, HistoryResponse, SendMessage};

    fn round_trip(payload: Payload) {
        let header = FrameHeader::new(payload.opcode());
        let frame = payload.clone().into_frame(header).expect("should create frame");
        let decoded = Payload::from_frame(&frame).expect("should parse payload");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn payload_join_trip_round_trip() {
        round_trip(Payload::JoinTrip);
    }

    #[test]
    fn payload_send_message_round_trip() {
        round_trip(Payload::SendMessage(SendMessage { body: "see you at the airport".into() }));
    }

    #[test]
    fn payload_history_response_round_trip() {
        round_trip(Payload::HistoryResponse(HistoryResponse {
            messages: vec![ChatMessage {
                id: 1,
                trip_id: 42,
                author_id: 7,
                author_name: "Alice Smith".into(),
                body: "Hello".into(),
                created_at_ms: 1_700_000_000_000,
            }],
            has_more: false,
        }));
    }

    #[test]
    fn payload_error_round_trip() {
        round_trip(Payload::Error(ErrorPayload::authorization("not a member of trip 42")));
    }

    #[test]
    fn mismatched_opcode_rejected() {
        // A SendMessage payload framed with a Hello opcode must not decode
        // as Hello.
        let payload = Payload::SendMessage(SendMessage { body: "hi".into() });
        let mut frame =
            payload.into_frame(FrameHeader::new(Opcode::SendMessage)).expect("should encode");
        frame.header.opcode = Opcode::Hello.to_u16().to_be_bytes();

        assert!(Payload::from_frame(&frame).is_err());
    }
}
