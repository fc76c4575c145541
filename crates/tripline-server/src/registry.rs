//! Connection registry for session and trip-room subscription tracking.
//!
//! The registry maintains bidirectional mappings: trip room → sessions (for
//! broadcast) and session → rooms (for cleanup on disconnect), giving O(1)
//! lookups in both directions. Sessions must explicitly join rooms; there is
//! no lazy room creation. Unregistering a session removes all its
//! subscriptions.
//!
//! The room tables are process-local and ephemeral: they are mutated only
//! inside the single driver context, and a reconnecting client must
//! re-authenticate and re-join every room.

use std::collections::{HashMap, HashSet};

use tripline_core::{Identity, TripId};

/// Information about a registered session.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Authenticated identity, `None` until the handshake completes.
    pub identity: Option<Identity>,
}

impl SessionInfo {
    /// Create a new unauthenticated session info.
    pub fn new() -> Self {
        Self { identity: None }
    }

    /// Create an authenticated session info.
    pub fn authenticated(identity: Identity) -> Self {
        Self { identity: Some(identity) }
    }

    /// Whether the session has completed authentication.
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

/// Registry tracking sessions and their trip-room subscriptions.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Session ID → session info
    sessions: HashMap<u64, SessionInfo>,
    /// Trip ID → set of subscribed session IDs
    trip_subscriptions: HashMap<TripId, HashSet<u64>>,
    /// Session ID → set of joined trip IDs
    session_trips: HashMap<u64, HashSet<TripId>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Returns `false` if the session id already
    /// exists.
    pub fn register_session(&mut self, session_id: u64, info: SessionInfo) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }

        self.sessions.insert(session_id, info);
        self.session_trips.insert(session_id, HashSet::new());
        true
    }

    /// Unregister a session and remove all its room subscriptions.
    ///
    /// Returns the session info if it existed, along with the trips it had
    /// joined.
    pub fn unregister_session(&mut self, session_id: u64) -> Option<(SessionInfo, HashSet<TripId>)> {
        let info = self.sessions.remove(&session_id)?;
        let trips = self.session_trips.remove(&session_id).unwrap_or_default();

        for trip_id in &trips {
            if let Some(subscribers) = self.trip_subscriptions.get_mut(trip_id) {
                subscribers.remove(&session_id);
                if subscribers.is_empty() {
                    self.trip_subscriptions.remove(trip_id);
                }
            }
        }

        Some((info, trips))
    }

    /// Session metadata. `None` if the session doesn't exist.
    pub fn session(&self, session_id: u64) -> Option<&SessionInfo> {
        self.sessions.get(&session_id)
    }

    /// Check if a session is registered.
    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Attach an authenticated identity to a session.
    ///
    /// Returns `false` if the session doesn't exist.
    pub fn authenticate_session(&mut self, session_id: u64, identity: Identity) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(info) => {
                info.identity = Some(identity);
                true
            },
            None => false,
        }
    }

    /// Subscribe a session to a trip room. Idempotent.
    ///
    /// Returns `false` if the session is not registered.
    pub fn subscribe(&mut self, session_id: u64, trip_id: TripId) -> bool {
        if !self.sessions.contains_key(&session_id) {
            return false;
        }

        self.trip_subscriptions.entry(trip_id).or_default().insert(session_id);
        self.session_trips.entry(session_id).or_default().insert(trip_id);
        true
    }

    /// Unsubscribe a session from a trip room.
    ///
    /// Returns `true` if the session was subscribed and is now removed.
    pub fn unsubscribe(&mut self, session_id: u64, trip_id: TripId) -> bool {
        let removed_from_trip =
            self.trip_subscriptions.get_mut(&trip_id).is_some_and(|s| s.remove(&session_id));

        let removed_from_session =
            self.session_trips.get_mut(&session_id).is_some_and(|t| t.remove(&trip_id));

        if self.trip_subscriptions.get(&trip_id).is_some_and(HashSet::is_empty) {
            self.trip_subscriptions.remove(&trip_id);
        }

        removed_from_trip && removed_from_session
    }

    /// Check if a session is subscribed to a trip room.
    pub fn is_subscribed(&self, session_id: u64, trip_id: TripId) -> bool {
        self.trip_subscriptions.get(&trip_id).is_some_and(|s| s.contains(&session_id))
    }

    /// All sessions subscribed to a trip room.
    pub fn sessions_in_trip(&self, trip_id: TripId) -> impl Iterator<Item = u64> + '_ {
        self.trip_subscriptions.get(&trip_id).into_iter().flat_map(|s| s.iter().copied())
    }

    /// All trips a session has joined.
    pub fn trips_for_session(&self, session_id: u64) -> impl Iterator<Item = TripId> + '_ {
        self.session_trips.get(&session_id).into_iter().flat_map(|t| t.iter().copied())
    }

    /// Total number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions subscribed to a trip room.
    pub fn trip_session_count(&self, trip_id: TripId) -> usize {
        self.trip_subscriptions.get(&trip_id).map_or(0, HashSet::len)
    }
}
