//! Operation codes identifying frame payload types.

/// Frame operation codes.
///
/// Session opcodes live in `0x000x`, live chat in `0x001x`, request/response
/// endpoints in `0x002x`. Unknown opcodes are rejected at decode time rather
/// than silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client handshake carrying the session credential.
    Hello = 0x0001,
    /// Server reply to a successful handshake.
    HelloAck = 0x0002,
    /// Graceful disconnect.
    Goodbye = 0x0003,

    /// Subscribe to a trip's chat room.
    JoinTrip = 0x0010,
    /// Unsubscribe from a trip's chat room.
    LeaveTrip = 0x0011,
    /// Send a chat message into a trip room.
    SendMessage = 0x0012,
    /// Server broadcast of a committed chat message.
    NewMessage = 0x0013,

    /// Request a page of persisted messages.
    HistoryRequest = 0x0020,
    /// Ordered page of persisted messages.
    HistoryResponse = 0x0021,
    /// Persist a message without live broadcast.
    PostMessage = 0x0022,
    /// Reply carrying the record created by `PostMessage`.
    PostAck = 0x0023,
    /// Register the authenticated user as a trip participant.
    RegisterParticipant = 0x0024,
    /// Reply to `RegisterParticipant`.
    RegisterAck = 0x0025,

    /// Error response.
    Error = 0x00FF,
}

impl Opcode {
    /// Raw u16 value for the wire.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse an opcode from its wire value. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Hello),
            0x0002 => Some(Self::HelloAck),
            0x0003 => Some(Self::Goodbye),
            0x0010 => Some(Self::JoinTrip),
            0x0011 => Some(Self::LeaveTrip),
            0x0012 => Some(Self::SendMessage),
            0x0013 => Some(Self::NewMessage),
            0x0020 => Some(Self::HistoryRequest),
            0x0021 => Some(Self::HistoryResponse),
            0x0022 => Some(Self::PostMessage),
            0x0023 => Some(Self::PostAck),
            0x0024 => Some(Self::RegisterParticipant),
            0x0025 => Some(Self::RegisterAck),
            0x00FF => Some(Self::Error),
            _ => None,
        }
    }
}
