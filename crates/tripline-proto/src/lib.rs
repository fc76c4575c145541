//! Wire protocol for the tripline chat service.
//!
//! A protocol frame is a fixed 64-byte binary header (Big Endian, parsed
//! zero-copy) followed by a CBOR payload. The header carries everything the
//! server needs for routing and echo matching (trip, sender, message id,
//! correlation id) so frames can be dispatched without payload
//! deserialization; the payload carries the typed message content.
//!
//! # Components
//!
//! - [`FrameHeader`]: fixed binary header with validation at the boundary
//! - [`Frame`]: header + raw payload bytes (transport layer)
//! - [`Payload`]: closed set of typed payloads, one opcode per variant
//! - [`Opcode`]: operation codes identifying payload types

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod errors;
mod frame;
mod header;
mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::{ErrorPayload, Payload};

/// ALPN protocol identifier negotiated during the QUIC handshake.
pub const ALPN_PROTOCOL: &[u8] = b"tripline";
