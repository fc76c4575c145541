//! Per-trip message sequencing and persistence.
//!
//! Assigns monotonically increasing message ids per trip (starting at 1)
//! and persists each message before returning it, so the caller broadcasts
//! only records that are already durably committed. The next id is cached
//! per trip, initialized lazily from storage.
//!
//! A storage conflict means the cache drifted from the persisted log (a
//! restart, or another writer against the same store). The trip's cache is
//! cleared so the next append re-initializes from storage.

use std::collections::{HashMap, hash_map::Entry};

use thiserror::Error;
use tripline_core::{Identity, TripId};
use tripline_proto::payloads::chat::ChatMessage;

use crate::storage::{Storage, StorageError};

/// Errors from message log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageLogError {
    /// Persistence failed; the message must not be broadcast.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The per-trip id sequence is exhausted.
    #[error("message id overflow for trip {0}")]
    IdOverflow(TripId),
}

/// Per-trip cached sequencing state.
#[derive(Debug, Clone)]
struct TripLog {
    /// Next message id to assign.
    next_message_id: u64,
}

/// Server-side message sequencer.
///
/// Owns the per-trip `next_message_id` cache. Not shared: exactly one
/// instance lives inside the driver, which is what serializes concurrent
/// sends into one commit order per trip.
#[derive(Debug, Default)]
pub struct MessageLog {
    trips: HashMap<TripId, TripLog>,
}

impl MessageLog {
    /// Create a new message log (empty cache).
    pub fn new() -> Self {
        Self { trips: HashMap::new() }
    }

    /// Assign the next id, build the record, and persist it.
    ///
    /// The append is durably committed before this returns; on any error
    /// nothing may be broadcast.
    ///
    /// # Errors
    ///
    /// - [`MessageLogError::Storage`] if persistence fails
    /// - [`MessageLogError::IdOverflow`] if the id sequence is exhausted
    pub fn append<S: Storage>(
        &mut self,
        trip_id: TripId,
        author: &Identity,
        body: String,
        created_at_ms: u64,
        storage: &S,
    ) -> Result<ChatMessage, MessageLogError> {
        let next_id = match self.trips.entry(trip_id) {
            Entry::Occupied(entry) => entry.get().next_message_id,
            Entry::Vacant(entry) => {
                let latest = storage.latest_message_id(trip_id)?;
                let next = latest.map_or(1, |id| id.saturating_add(1));

                tracing::debug!(trip_id, next_message_id = next, "message log initialized");

                entry.insert(TripLog { next_message_id: next }).next_message_id
            },
        };

        let bumped = next_id.checked_add(1).ok_or(MessageLogError::IdOverflow(trip_id))?;

        let message = ChatMessage {
            id: next_id,
            trip_id,
            author_id: author.user_id,
            author_name: author.display_name.clone(),
            body,
            created_at_ms,
        };

        if let Err(err) = storage.append_message(trip_id, next_id, &message) {
            if matches!(err, StorageError::Conflict { .. }) {
                tracing::warn!(trip_id, error = %err, "clearing message log cache after id conflict");
                self.trips.remove(&trip_id);
            }
            return Err(err.into());
        }

        if let Some(log) = self.trips.get_mut(&trip_id) {
            log.next_message_id = bumped;
        }

        Ok(message)
    }

    /// Pre-initialize a trip's sequence from storage.
    ///
    /// Optional recovery hook for warming the cache before accepting
    /// traffic. No-op if the trip is already initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage query fails.
    pub fn initialize_trip<S: Storage>(
        &mut self,
        trip_id: TripId,
        storage: &S,
    ) -> Result<(), MessageLogError> {
        if self.trips.contains_key(&trip_id) {
            return Ok(());
        }

        let latest = storage.latest_message_id(trip_id)?;
        let next = latest.map_or(1, |id| id.saturating_add(1));

        tracing::info!(trip_id, next_message_id = next, "message log pre-initialized");

        self.trips.insert(trip_id, TripLog { next_message_id: next });

        Ok(())
    }

    /// Next id that will be assigned for a trip (testing/debugging).
    #[cfg(test)]
    pub fn next_message_id(&self, trip_id: TripId) -> Option<u64> {
        self.trips.get(&trip_id).map(|t| t.next_message_id)
    }
}
