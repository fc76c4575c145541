use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tripline_core::{TripId, UserId};
use tripline_proto::payloads::chat::ChatMessage;

use super::{ParticipantRecord, Storage, StorageError, TripRecord, UserRecord};

/// In-memory storage implementation for testing and single-run deployments.
///
/// `HashMap`s behind an `Arc<Mutex>` so clones share state. Messages are
/// held in a `Vec` per trip in id order, making appends and latest-id
/// queries O(1) and history loads O(limit). Uses `lock().expect()`, which
/// panics if the mutex is poisoned; acceptable here since a poisoned lock
/// means a thread already panicked mid-operation.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

struct MemoryStorageInner {
    /// Trip records (owner, name)
    trips: HashMap<TripId, TripRecord>,

    /// User profile records
    users: HashMap<UserId, UserRecord>,

    /// Participant registrations per trip, keyed by user id
    participants: HashMap<TripId, HashMap<UserId, ParticipantRecord>>,

    /// Messages per trip in id order; the message with id `n` sits at
    /// index `n - 1`
    messages: HashMap<TripId, Vec<ChatMessage>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner {
                trips: HashMap::new(),
                users: HashMap::new(),
                participants: HashMap::new(),
                messages: HashMap::new(),
            })),
        }
    }

    /// Total number of messages across all trips. Useful in tests.
    #[allow(clippy::expect_used)]
    pub fn total_message_count(&self) -> usize {
        let inner = self.inner.lock().expect("mutex poisoned");
        inner.messages.values().map(Vec::len).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)]
impl Storage for MemoryStorage {
    fn append_message(
        &self,
        trip_id: TripId,
        message_id: u64,
        message: &ChatMessage,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");

        let messages = inner.messages.entry(trip_id).or_default();

        let expected_id = messages.len() as u64 + 1;
        if message_id != expected_id {
            return Err(StorageError::Conflict { expected: expected_id, got: message_id });
        }

        messages.push(message.clone());

        debug_assert_eq!(messages.len() as u64, message_id);

        Ok(())
    }

    fn latest_message_id(&self, trip_id: TripId) -> Result<Option<u64>, StorageError> {
        let inner = self.inner.lock().expect("mutex poisoned");

        Ok(inner.messages.get(&trip_id).and_then(|messages| {
            if messages.is_empty() { None } else { Some(messages.len() as u64) }
        }))
    }

    fn load_messages(
        &self,
        trip_id: TripId,
        from_id: u64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let inner = self.inner.lock().expect("mutex poisoned");

        let Some(messages) = inner.messages.get(&trip_id) else {
            return Ok(Vec::new());
        };

        let start = from_id.max(1) as usize - 1;
        if start >= messages.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(limit).min(messages.len());

        Ok(messages[start..end].to_vec())
    }

    fn create_trip(&self, trip_id: TripId, record: &TripRecord) -> Result<(), StorageError> {
        self.inner
            .lock()
            .expect("mutex poisoned")
            .trips
            .entry(trip_id)
            .or_insert_with(|| record.clone());
        Ok(())
    }

    fn load_trip(&self, trip_id: TripId) -> Result<Option<TripRecord>, StorageError> {
        Ok(self.inner.lock().expect("mutex poisoned").trips.get(&trip_id).cloned())
    }

    fn list_trips(&self) -> Result<Vec<TripId>, StorageError> {
        Ok(self.inner.lock().expect("mutex poisoned").trips.keys().copied().collect())
    }

    fn upsert_user(&self, user_id: UserId, record: &UserRecord) -> Result<(), StorageError> {
        self.inner.lock().expect("mutex poisoned").users.insert(user_id, record.clone());
        Ok(())
    }

    fn load_user(&self, user_id: UserId) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.inner.lock().expect("mutex poisoned").users.get(&user_id).cloned())
    }

    fn add_participant(
        &self,
        trip_id: TripId,
        record: &ParticipantRecord,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let participants = inner.participants.entry(trip_id).or_default();

        if participants.contains_key(&record.user_id) {
            return Ok(false);
        }

        participants.insert(record.user_id, record.clone());
        Ok(true)
    }

    fn is_participant(&self, trip_id: TripId, user_id: UserId) -> Result<bool, StorageError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner.participants.get(&trip_id).is_some_and(|p| p.contains_key(&user_id)))
    }
}
