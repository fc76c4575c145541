//! Signed session credentials.
//!
//! A credential is a CBOR document: [`SessionClaims`] (user id, issue and
//! expiry times) plus a 64-byte Ed25519 signature over the serialized
//! claims. The login service holds the signing half ([`SessionKey`]); the
//! chat server only ever needs the verifying half ([`SessionVerifier`]).
//!
//! The credential deliberately carries no display name. Names are resolved
//! fresh from the user directory on every handshake, so a rename takes
//! effect immediately instead of whenever the credential happens to expire.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{error::CredentialError, identity::UserId};

/// Claims carried by a session credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject user id.
    pub user_id: UserId,
    /// Issue time, Unix seconds.
    pub issued_at_secs: u64,
    /// Expiry time, Unix seconds. The credential is invalid at and after
    /// this instant.
    pub expires_at_secs: u64,
}

/// Wire form of a credential: claims plus detached signature.
#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    claims: SessionClaims,
    signature: Vec<u8>,
}

/// Signing half of the session key pair.
///
/// Held by the login service (and by tests). The chat server never sees
/// this; it verifies with [`SessionVerifier`] only.
pub struct SessionKey {
    signing: SigningKey,
}

impl SessionKey {
    /// Construct a key from a 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(&seed) }
    }

    /// The verifying half for this key.
    #[must_use]
    pub fn verifier(&self) -> SessionVerifier {
        SessionVerifier { verifying: self.signing.verifying_key() }
    }

    /// Issue a credential for `user_id`, valid for `ttl_secs` from
    /// `issued_at_secs`.
    #[must_use]
    pub fn issue(&self, user_id: UserId, issued_at_secs: u64, ttl_secs: u64) -> Vec<u8> {
        let claims = SessionClaims {
            user_id,
            issued_at_secs,
            expires_at_secs: issued_at_secs.saturating_add(ttl_secs),
        };

        let mut claim_bytes = Vec::new();
        #[allow(clippy::expect_used)]
        ciborium::ser::into_writer(&claims, &mut claim_bytes)
            .expect("invariant: claims are a plain struct and always serialize");

        let signature = self.signing.sign(&claim_bytes);
        let envelope = TokenEnvelope { claims, signature: signature.to_bytes().to_vec() };

        let mut token = Vec::new();
        #[allow(clippy::expect_used)]
        ciborium::ser::into_writer(&envelope, &mut token)
            .expect("invariant: envelope is a plain struct and always serializes");
        token
    }
}

/// Verifying half of the session key pair, held by the chat server.
#[derive(Debug, Clone)]
pub struct SessionVerifier {
    verifying: VerifyingKey,
}

impl SessionVerifier {
    /// Construct a verifier from a 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Malformed`] if the bytes are not a valid
    /// Ed25519 public key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CredentialError> {
        VerifyingKey::from_bytes(bytes)
            .map(|verifying| Self { verifying })
            .map_err(|e| CredentialError::Malformed(e.to_string()))
    }

    /// The raw 32-byte public key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    /// Verify a credential and return its claims.
    ///
    /// Checks, in order: presence, parseability, signature, expiry. CBOR
    /// encoding is deterministic, so re-serializing the claims reproduces
    /// the exact bytes that were signed.
    ///
    /// # Errors
    ///
    /// Any [`CredentialError`] variant; all of them refuse the connection.
    pub fn verify(&self, token: &[u8], now_secs: u64) -> Result<SessionClaims, CredentialError> {
        if token.is_empty() {
            return Err(CredentialError::Missing);
        }

        let envelope: TokenEnvelope = ciborium::de::from_reader(token)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;

        let signature_bytes: [u8; 64] = envelope
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| CredentialError::Malformed("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&signature_bytes);

        let mut claim_bytes = Vec::new();
        ciborium::ser::into_writer(&envelope.claims, &mut claim_bytes)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;

        self.verifying
            .verify(&claim_bytes, &signature)
            .map_err(|_| CredentialError::BadSignature)?;

        if envelope.claims.expires_at_secs <= now_secs {
            return Err(CredentialError::Expired {
                expires_at_secs: envelope.claims.expires_at_secs,
                now_secs,
            });
        }

        Ok(envelope.claims)
    }
}
