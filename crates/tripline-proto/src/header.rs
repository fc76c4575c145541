//! Frame header implementation with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 64-byte structure serialized as raw binary
//! (Big Endian). Everything the server needs for routing and echo matching
//! lives here, so frames can be dispatched and correlated without touching
//! the CBOR payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 64-byte frame header (Big Endian network byte order).
///
/// Fields are stored as raw byte arrays to avoid alignment issues. The
/// `#[repr(C, packed)]` layout with zerocopy traits means the struct can be
/// safely cast from untrusted network bytes: every 64-byte pattern is a
/// valid representation, so parsing cannot cause undefined behavior.
///
/// The `correlation_id` is the client-generated identifier linking an
/// optimistic message to its server-confirmed echo. The server copies it
/// verbatim into the broadcast `NewMessage` header and into any error frame
/// that dooms the send, which is what lets the sender resolve its local
/// copy without payload decoding.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    // Protocol identification (8 bytes: 0-7)
    magic: [u8; 4],             // 0x54524950 ("TRIP" in ASCII)
    version: u8,                // 0x01
    reserved: u8,               // must be zero
    pub(crate) opcode: [u8; 2], // u16 operation code

    // Payload metadata (4 bytes: 8-11)
    pub(crate) payload_size: [u8; 4], // u32 payload length

    // Routing context (16 bytes: 12-27)
    trip_id: [u8; 8],   // u64 trip identifier
    sender_id: [u8; 8], // u64 authenticated user id (server-verified)

    // Commit metadata, server-assigned (16 bytes: 28-43)
    message_id: [u8; 8],   // u64 per-trip monotonic id, 0 from clients
    timestamp_ms: [u8; 8], // u64 Unix milliseconds, 0 from clients

    // Optimistic-message correlation (16 bytes: 44-59)
    correlation_id: [u8; 16], // u128 client-generated, 0 when absent

    // Reserved tail (4 bytes: 60-63)
    tail: [u8; 4],
}

impl FrameHeader {
    /// Size of the serialized header (64 bytes, one CPU cache line).
    pub const SIZE: usize = 64;

    /// Magic number: "TRIP" in ASCII (0x54524950).
    pub const MAGIC: u32 = 0x5452_4950;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (1 MiB). Sized for a full history page of
    /// maximum-length bodies; the limit exists to bound allocation on
    /// untrusted input.
    pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

    /// Create a new header with the specified opcode.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            reserved: 0,
            opcode: opcode.to_u16().to_be_bytes(),
            payload_size: [0; 4],
            trip_id: [0; 8],
            sender_id: [0; 8],
            message_id: [0; 8],
            timestamp_ms: [0; 8],
            correlation_id: [0; 16],
            tail: [0; 4],
        }
    }

    /// Parse a header from network bytes (zero-copy).
    ///
    /// Validation order is cheapest first: length, magic, version, payload
    /// size limit. All checks run before any payload allocation.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTooShort`] if the buffer is under 64 bytes
    /// - [`ProtocolError::InvalidMagic`] on magic mismatch
    /// - [`ProtocolError::UnsupportedVersion`] on version mismatch
    /// - [`ProtocolError::PayloadTooLarge`] if the claimed payload exceeds
    ///   [`Self::MAX_PAYLOAD_SIZE`]
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize the header to its 64-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Protocol magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Trip the frame is scoped to.
    #[must_use]
    pub fn trip_id(&self) -> u64 {
        u64::from_be_bytes(self.trip_id)
    }

    /// Sending user id. Informational from clients; the server trusts only
    /// the identity bound to the session at authentication.
    #[must_use]
    pub fn sender_id(&self) -> u64 {
        u64::from_be_bytes(self.sender_id)
    }

    /// Server-assigned per-trip message id. Zero on client frames.
    #[must_use]
    pub fn message_id(&self) -> u64 {
        u64::from_be_bytes(self.message_id)
    }

    /// Commit timestamp in Unix milliseconds. Zero on client frames.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        u64::from_be_bytes(self.timestamp_ms)
    }

    /// Client correlation id, zero when absent.
    #[must_use]
    pub fn correlation_id(&self) -> u128 {
        u128::from_be_bytes(self.correlation_id)
    }

    /// Update the trip id.
    pub fn set_trip_id(&mut self, trip_id: u64) {
        self.trip_id = trip_id.to_be_bytes();
    }

    /// Update the sender id.
    pub fn set_sender_id(&mut self, sender_id: u64) {
        self.sender_id = sender_id.to_be_bytes();
    }

    /// Assign the committed message id (server use only).
    pub fn set_message_id(&mut self, message_id: u64) {
        self.message_id = message_id.to_be_bytes();
    }

    /// Set the commit timestamp (server use only).
    pub fn set_timestamp_ms(&mut self, timestamp_ms: u64) {
        self.timestamp_ms = timestamp_ms.to_be_bytes();
    }

    /// Set the client correlation id.
    pub fn set_correlation_id(&mut self, correlation_id: u128) {
        self.correlation_id = correlation_id.to_be_bytes();
    }

    /// Set payload size. [`crate::Frame::new`] does this automatically.
    pub fn set_payload_size(&mut self, size: u32) {
        self.payload_size = size.to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("payload_size", &self.payload_size())
            .field("trip_id", &self.trip_id())
            .field("sender_id", &self.sender_id())
            .field("message_id", &self.message_id())
            .field("timestamp_ms", &self.timestamp_ms())
            .field("correlation_id", &format!("{:#034x}", self.correlation_id()))
            .finish_non_exhaustive()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}
