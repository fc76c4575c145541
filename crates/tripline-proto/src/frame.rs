//! Frame type combining header and payload.
//!
//! A `Frame` is the transport-layer packet: a 64-byte raw binary header
//! followed by variable-length payload bytes (already CBOR-encoded). This is
//! a pure data holder; for typed access see [`crate::Payload::into_frame`]
//! and [`crate::Payload::from_frame`].

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol frame.
///
/// Layout on the wire: `[FrameHeader: 64 bytes] + [payload: variable]`.
///
/// Holds raw payload bytes, not the `Payload` enum, so the server can route
/// and broadcast frames without deserializing content. `payload.len()`
/// always matches `header.payload_size()`: [`Frame::new`] sets the field and
/// [`Frame::decode`] verifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header (64 bytes)
    pub header: FrameHeader,

    /// Raw payload bytes (already CBOR-encoded)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame, setting `payload_size` to match the payload.
    ///
    /// # Panics
    ///
    /// Panics if `payload.len() > u32::MAX`, which cannot happen in practice
    /// because `Bytes` is bounded by `isize::MAX` and the protocol limit is
    /// far below `u32::MAX`.
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        #[allow(clippy::expect_used)]
        let payload_len = u32::try_from(payload.len())
            .expect("invariant: payload length fits in u32 (bounded by the protocol limit)");

        header.payload_size = payload_len.to_be_bytes();

        debug_assert_eq!(header.payload_size(), payload_len);

        Self { header, payload }
    }

    /// Encode the frame into a buffer.
    ///
    /// This is the enforcement point for the payload size limit; oversized
    /// frames are rejected here to bound allocations on the receiving side.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    ///   [`FrameHeader::MAX_PAYLOAD_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode a frame from wire format.
    ///
    /// Header validation happens before any payload allocation; exactly
    /// `payload_size` bytes are read and trailing data is ignored. The
    /// payload is NOT CBOR-parsed here.
    ///
    /// # Errors
    ///
    /// - Any header parse error from [`FrameHeader::from_bytes`]
    /// - [`ProtocolError::FrameTruncated`] if fewer payload bytes are
    ///   available than the header claims
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        if bytes.len() < total_size {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        }

        // Bounds checked above: FrameHeader::SIZE <= total_size <= bytes.len()
        let payload = Bytes::copy_from_slice(&bytes[FrameHeader::SIZE..total_size]);

        debug_assert_eq!(payload.len(), payload_size);

        Ok(Self { header: *header, payload })
    }
}
