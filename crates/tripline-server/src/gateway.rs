//! Connection authentication.
//!
//! Every live connection must present a signed session credential in its
//! first frame. The gateway verifies signature and expiry, then resolves
//! the subject's current display name from the user directory. The lookup
//! is fresh on every handshake, so a profile rename applies immediately
//! rather than whenever the credential expires.
//!
//! A failed handshake refuses the connection outright; the driver processes
//! no other event until authentication succeeds.

use thiserror::Error;
use tripline_core::{CredentialError, Identity, SessionVerifier, UserId};
use tripline_proto::payloads::session::Hello;

use crate::storage::{Storage, StorageError};

/// Errors from handshake authentication.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credential verification failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The credential's subject no longer exists.
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    /// Storage lookup failed during authentication.
    #[error("storage error during authentication: {0}")]
    Storage(#[from] StorageError),
}

/// Authenticates new live connections.
pub struct ConnectionGateway {
    verifier: SessionVerifier,
}

impl ConnectionGateway {
    /// Create a gateway that verifies credentials against the given key.
    pub fn new(verifier: SessionVerifier) -> Self {
        Self { verifier }
    }

    /// Authenticate a handshake.
    ///
    /// Verifies the credential (presence, parseability, signature, expiry)
    /// and resolves the subject's current display name.
    ///
    /// # Errors
    ///
    /// Any [`AuthError`]; all of them refuse the connection.
    pub fn authenticate<S: Storage>(
        &self,
        hello: &Hello,
        now_secs: u64,
        storage: &S,
    ) -> Result<Identity, AuthError> {
        let claims = self.verifier.verify(&hello.token, now_secs)?;

        let user = storage
            .load_user(claims.user_id)?
            .ok_or(AuthError::UnknownUser(claims.user_id))?;

        Ok(Identity::new(claims.user_id, user.display_name))
    }
}
