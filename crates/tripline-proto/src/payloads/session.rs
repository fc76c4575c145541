//! Session handshake payloads.
//!
//! Authentication happens before anything else: the first frame on a
//! connection must be a `Hello` carrying the signed session credential, and
//! the server refuses the connection outright if verification fails.

use serde::{Deserialize, Serialize};

/// Initial handshake carrying the signed session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Opaque credential bytes issued by the login service.
    pub token: Vec<u8>,
}

/// Server reply to a successful handshake.
///
/// Carries the identity the server resolved for this session. The display
/// name is looked up fresh at authentication time, so a profile rename is
/// reflected here rather than in the (stale) credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    /// Authenticated user id.
    pub user_id: u64,
    /// Current display name from the user directory.
    pub display_name: String,
}

/// Graceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Reason for disconnecting.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip() {
        let original = Hello { token: vec![0xAB; 96] };

        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&original, &mut encoded).unwrap();
        let decoded: Hello = ciborium::de::from_reader(&encoded[..]).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn hello_ack_serde() {
        let ack = HelloAck { user_id: 7, display_name: "Alice Smith".into() };
        let cbor = ciborium::ser::into_writer(&ack, Vec::new());
        assert!(cbor.is_ok());
    }
}
