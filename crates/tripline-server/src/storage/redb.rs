//! Redb-backed durable storage implementation.
//!
//! Uses redb's ACID transactions with copy-on-write for crash safety. All
//! state survives server restarts. Composite keys are big-endian so
//! lexicographic order equals numeric order, which makes history loads a
//! single range scan.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use tripline_core::{TripId, UserId};
use tripline_proto::payloads::chat::ChatMessage;

use super::{ParticipantRecord, Storage, StorageError, TripRecord, UserRecord};

/// Table: messages
/// Key: (trip_id: u64, message_id: u64) as big-endian bytes [16 bytes]
/// Value: CBOR-encoded ChatMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: trips
/// Key: trip_id as big-endian bytes [8 bytes]
/// Value: CBOR-encoded TripRecord
const TRIPS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("trips");

/// Table: users
/// Key: user_id as big-endian bytes [8 bytes]
/// Value: CBOR-encoded UserRecord
const USERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("users");

/// Table: participants
/// Key: (trip_id: u64, user_id: u64) as big-endian bytes [16 bytes]
/// Value: CBOR-encoded ParticipantRecord
const PARTICIPANTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("participants");

/// Durable storage backed by redb.
///
/// Thread-safe through redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a redb database at the given path.
    ///
    /// Creates the tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        let txn = db.begin_write().map_err(io_err)?;
        {
            let _ = txn.open_table(MESSAGES).map_err(io_err)?;
            let _ = txn.open_table(TRIPS).map_err(io_err)?;
            let _ = txn.open_table(USERS).map_err(io_err)?;
            let _ = txn.open_table(PARTICIPANTS).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Find the latest message id for a trip by scanning its key range.
    fn scan_latest_message_id<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        trip_id: TripId,
    ) -> Result<Option<u64>, StorageError> {
        let start_key = encode_message_key(trip_id, 0);
        let end_key = encode_message_key(trip_id, u64::MAX);

        let results = table.range(start_key.as_slice()..=end_key.as_slice()).map_err(io_err)?;

        let mut latest: Option<u64> = None;
        for result in results {
            let (key, _) = result.map_err(io_err)?;
            let (_, message_id) = decode_message_key(key.value());
            latest = Some(message_id);
        }

        Ok(latest)
    }
}

impl Storage for RedbStorage {
    fn append_message(
        &self,
        trip_id: TripId,
        message_id: u64,
        message: &ChatMessage,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;

        {
            let mut table = txn.open_table(MESSAGES).map_err(io_err)?;

            let expected_id =
                Self::scan_latest_message_id(&table, trip_id)?.map_or(1, |latest| latest + 1);

            if message_id != expected_id {
                return Err(StorageError::Conflict { expected: expected_id, got: message_id });
            }

            let mut bytes = Vec::new();
            ciborium::ser::into_writer(message, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            let key = encode_message_key(trip_id, message_id);
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
        }

        txn.commit().map_err(io_err)?;

        Ok(())
    }

    fn latest_message_id(&self, trip_id: TripId) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(MESSAGES).map_err(io_err)?;

        Self::scan_latest_message_id(&table, trip_id)
    }

    fn load_messages(
        &self,
        trip_id: TripId,
        from_id: u64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(MESSAGES).map_err(io_err)?;

        let start_key = encode_message_key(trip_id, from_id.max(1));
        let end_key = encode_message_key(trip_id, u64::MAX);

        let results = table.range(start_key.as_slice()..=end_key.as_slice()).map_err(io_err)?;

        let mut messages = Vec::with_capacity(limit.min(64));
        for result in results {
            if messages.len() >= limit {
                break;
            }

            let (key, value) = result.map_err(io_err)?;
            let (key_trip_id, _) = decode_message_key(key.value());

            if key_trip_id != trip_id {
                break;
            }

            let message: ChatMessage = ciborium::de::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            messages.push(message);
        }

        Ok(messages)
    }

    fn create_trip(&self, trip_id: TripId, record: &TripRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;

        {
            let mut table = txn.open_table(TRIPS).map_err(io_err)?;

            let key = encode_id_key(trip_id);

            if table.get(key.as_slice()).map_err(io_err)?.is_some() {
                return Ok(()); // Already exists, don't overwrite
            }

            let mut bytes = Vec::new();
            ciborium::ser::into_writer(record, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
        }

        txn.commit().map_err(io_err)?;

        Ok(())
    }

    fn load_trip(&self, trip_id: TripId) -> Result<Option<TripRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(TRIPS).map_err(io_err)?;

        let key = encode_id_key(trip_id);

        match table.get(key.as_slice()).map_err(io_err)? {
            Some(value) => {
                let record: TripRecord = ciborium::de::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(record))
            },
            None => Ok(None),
        }
    }

    fn list_trips(&self) -> Result<Vec<TripId>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(TRIPS).map_err(io_err)?;

        let mut trips = Vec::new();

        for result in table.iter().map_err(io_err)? {
            let (key, _) = result.map_err(io_err)?;
            trips.push(decode_id_key(key.value()));
        }

        Ok(trips)
    }

    fn upsert_user(&self, user_id: UserId, record: &UserRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;

        {
            let mut table = txn.open_table(USERS).map_err(io_err)?;

            let mut bytes = Vec::new();
            ciborium::ser::into_writer(record, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            let key = encode_id_key(user_id);
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
        }

        txn.commit().map_err(io_err)?;

        Ok(())
    }

    fn load_user(&self, user_id: UserId) -> Result<Option<UserRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(USERS).map_err(io_err)?;

        let key = encode_id_key(user_id);

        match table.get(key.as_slice()).map_err(io_err)? {
            Some(value) => {
                let record: UserRecord = ciborium::de::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(record))
            },
            None => Ok(None),
        }
    }

    fn add_participant(
        &self,
        trip_id: TripId,
        record: &ParticipantRecord,
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;

        let created = {
            let mut table = txn.open_table(PARTICIPANTS).map_err(io_err)?;

            let key = encode_pair_key(trip_id, record.user_id);

            if table.get(key.as_slice()).map_err(io_err)?.is_some() {
                false // Already registered, keep the original record
            } else {
                let mut bytes = Vec::new();
                ciborium::ser::into_writer(record, &mut bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;

                table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
                true
            }
        };

        txn.commit().map_err(io_err)?;

        Ok(created)
    }

    fn is_participant(&self, trip_id: TripId, user_id: UserId) -> Result<bool, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(PARTICIPANTS).map_err(io_err)?;

        let key = encode_pair_key(trip_id, user_id);
        Ok(table.get(key.as_slice()).map_err(io_err)?.is_some())
    }
}

fn io_err(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Encode (trip_id, message_id) as a 16-byte big-endian key.
fn encode_message_key(trip_id: TripId, message_id: u64) -> [u8; 16] {
    encode_pair_key(trip_id, message_id)
}

/// Decode a message key back to (trip_id, message_id).
fn decode_message_key(key: &[u8]) -> (TripId, u64) {
    debug_assert_eq!(key.len(), 16);
    let trip_id = u64::from_be_bytes(key[..8].try_into().expect("key length verified"));
    let message_id = u64::from_be_bytes(key[8..].try_into().expect("key length verified"));
    (trip_id, message_id)
}

/// Encode a (u64, u64) composite as a 16-byte big-endian key.
fn encode_pair_key(first: u64, second: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&first.to_be_bytes());
    key[8..].copy_from_slice(&second.to_be_bytes());
    key
}

/// Encode a u64 as an 8-byte big-endian key.
fn encode_id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Decode an 8-byte big-endian key back to u64.
fn decode_id_key(key: &[u8]) -> u64 {
    debug_assert_eq!(key.len(), 8);
    u64::from_be_bytes(key.try_into().expect("key length verified"))
}
