//! Client
//!
//! Action-based chat client for the tripline protocol. Shows messages
//! optimistically the moment the user sends them and reconciles each one
//! against the server-confirmed record sharing its correlation id.
//!
//! # Architecture
//!
//! The client is Sans-IO, like the server driver: it receives events
//! ([`ClientEvent`]), processes them through pure state machine logic, and
//! returns actions ([`ClientAction`]) for the caller to execute. The caller
//! owns the socket, drives time forward via ticks, and reads the reconciled
//! message lists for rendering.
//!
//! # Components
//!
//! - [`ChatClient`]: top-level state machine managing per-trip conversations
//! - [`LocalMessage`]/[`MessageStatus`]: the Pending → Confirmed/Failed
//!   per-message state machine
//! - [`ClientEvent`]: events fed into the client
//! - [`ClientAction`]: actions produced by the client
//!
//! # Transport (optional)
//!
//! With the `transport` feature enabled, this crate also provides
//! [`transport::connect`] for a QUIC connection with frame channels.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod error;
mod event;

#[cfg(feature = "transport")]
pub mod transport;

pub use client::{ChatClient, LocalMessage, MessageStatus, PENDING_TIMEOUT};
pub use error::ClientError;
pub use event::{ClientAction, ClientEvent};
pub use tripline_core::{Identity, TripId, UserId, env::Environment};
