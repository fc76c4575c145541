//! Per-connection session state machine.
//!
//! Tracks one live connection from accept to close: a connection starts in
//! `Init`, becomes `Ready` when its handshake authenticates, and is swept
//! by the driver's tick if it never authenticates or goes idle. Pure state
//! machine; the driver feeds times in and executes the returned actions.
//!
//! Generic over `I` (instant type) so tests can drive virtual time.

use std::time::Duration;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, handshake not yet authenticated.
    Init,
    /// Authenticated and processing frames.
    Ready,
    /// Closed; no further events are processed.
    Closed,
}

/// Connection timeout configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a connection may stay in `Init` before it is closed.
    pub handshake_timeout: Duration,
    /// How long a `Ready` connection may go without activity.
    pub idle_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Actions produced by the connection state machine.
#[derive(Debug, Clone)]
pub enum ConnectionAction {
    /// Close the connection.
    Close {
        /// Reason for closure.
        reason: String,
    },
}

/// State machine for one live connection.
#[derive(Debug, Clone)]
pub struct Connection<I> {
    state: ConnectionState,
    config: ConnectionConfig,
    created_at: I,
    last_activity: I,
}

impl<I: Copy + Ord + std::ops::Sub<Output = Duration>> Connection<I> {
    /// Create a connection in the `Init` state.
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        Self { state: ConnectionState::Init, config, created_at: now, last_activity: now }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once the handshake has authenticated.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Transition to `Ready` after a successful handshake.
    pub fn mark_ready(&mut self, now: I) {
        if self.state == ConnectionState::Init {
            self.state = ConnectionState::Ready;
            self.last_activity = now;
        }
    }

    /// Record activity on the connection.
    pub fn update_activity(&mut self, now: I) {
        self.last_activity = now;
    }

    /// Mark the connection closed.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Periodic timeout check.
    ///
    /// Returns a close action if the handshake window or the idle window
    /// has elapsed. The connection is marked closed so a later tick does
    /// not emit the action twice.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Init if now - self.created_at >= self.config.handshake_timeout => {
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::Close { reason: "handshake timeout".to_string() }]
            },
            ConnectionState::Ready if now - self.last_activity >= self.config.idle_timeout => {
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::Close { reason: "idle timeout".to_string() }]
            },
            _ => Vec::new(),
        }
    }
}
