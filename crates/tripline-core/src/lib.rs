//! Shared domain types for the tripline chat service.
//!
//! This crate holds everything both the server and the client need:
//! identity types, the signed session credential, the per-connection
//! session state machine, and the [`env::Environment`] abstraction that
//! decouples protocol logic from system time and randomness.
//!
//! # Architecture
//!
//! Protocol logic across the workspace is Sans-IO: state machines consume
//! events and return actions, and runtime glue performs the actual I/O.
//! Nothing in this crate touches the network or the clock directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod credential;
pub mod env;
pub mod error;
pub mod identity;

pub use credential::{SessionClaims, SessionKey, SessionVerifier};
pub use error::CredentialError;
pub use identity::{Identity, TripId, UserId};
