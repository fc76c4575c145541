//! Error types for the tripline core.

use thiserror::Error;

/// Errors from session credential verification.
///
/// All variants refuse the connection before any other event is processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// No credential was presented in the handshake.
    #[error("credential missing from handshake")]
    Missing,

    /// Credential bytes could not be parsed.
    #[error("malformed credential: {0}")]
    Malformed(String),

    /// Credential is past its expiry.
    #[error("credential expired at {expires_at_secs} (now {now_secs})")]
    Expired {
        /// Expiry claim from the credential
        expires_at_secs: u64,
        /// Server wall clock at verification time
        now_secs: u64,
    },

    /// Signature did not verify against the session key.
    #[error("credential signature verification failed")]
    BadSignature,
}
