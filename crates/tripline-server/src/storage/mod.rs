//! Storage abstraction for the tripline chat service.
//!
//! Trait-based abstraction over the records chat reads (trips, users) and
//! the records it owns (messages, participants). The trait is synchronous so
//! the driver's logic stays free of I/O scheduling; both backends commit
//! before returning, which is what lets the driver guarantee that broadcast
//! happens only after the append is durable.
//!
//! Trips and users are owned and mutated by the out-of-scope CRUD layer;
//! chat only reads them. Messages are append-only with per-trip sequential
//! ids starting at 1. Participants are created once and never updated or
//! deleted by this subsystem.

mod error;
mod memory;
mod redb;

pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};
use tripline_core::{TripId, UserId};
use tripline_proto::payloads::chat::ChatMessage;

pub use self::redb::RedbStorage;

/// Trip record, owned by the trip-planning CRUD. Chat reads it for
/// ownership checks only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRecord {
    /// User who owns the trip.
    pub owner_id: UserId,
    /// Trip name.
    pub name: String,
    /// Unix timestamp (seconds) when the trip was created.
    pub created_at_secs: u64,
}

/// User profile record, owned by the account CRUD. Chat reads it to resolve
/// display names at authentication time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Current display name.
    pub display_name: String,
}

/// Participant registration granting chat access to a non-owner.
///
/// Keyed by the stable user id; the display name is retained purely for
/// presentation and plays no part in membership decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Registered user.
    pub user_id: UserId,
    /// Display name at registration time.
    pub display_name: String,
    /// Unix timestamp (seconds) of registration.
    pub joined_at_secs: u64,
}

/// Storage abstraction for chat state.
///
/// Must be `Clone` (shared between the driver and runtime glue) and
/// `Send + Sync`. Implementations typically share internal state via `Arc`,
/// so clones access the same underlying store.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Append a message to a trip's log.
    ///
    /// # Invariants
    ///
    /// - Pre: `message_id` must be exactly one past the latest stored id
    ///   (or 1 for an empty log); anything else is a
    ///   [`StorageError::Conflict`]
    /// - Post: the message is durably committed before this returns
    fn append_message(
        &self,
        trip_id: TripId,
        message_id: u64,
        message: &ChatMessage,
    ) -> Result<(), StorageError>;

    /// Latest message id for a trip. `None` if no messages stored.
    fn latest_message_id(&self, trip_id: TripId) -> Result<Option<u64>, StorageError>;

    /// Load messages in `[from_id, from_id + limit)`, ascending by id.
    ///
    /// Returns fewer than `limit` messages when the log ends first, and an
    /// empty vector when `from_id` is past the end.
    fn load_messages(
        &self,
        trip_id: TripId,
        from_id: u64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError>;

    /// Create a trip record. Idempotent; an existing record is not
    /// overwritten.
    fn create_trip(&self, trip_id: TripId, record: &TripRecord) -> Result<(), StorageError>;

    /// Load a trip record. `None` if the trip does not exist.
    fn load_trip(&self, trip_id: TripId) -> Result<Option<TripRecord>, StorageError>;

    /// All trip ids with stored records. Order is not guaranteed.
    fn list_trips(&self) -> Result<Vec<TripId>, StorageError>;

    /// Create or replace a user profile record.
    fn upsert_user(&self, user_id: UserId, record: &UserRecord) -> Result<(), StorageError>;

    /// Load a user profile record. `None` if the user does not exist.
    fn load_user(&self, user_id: UserId) -> Result<Option<UserRecord>, StorageError>;

    /// Register a participant. Idempotent: returns `true` if a new record
    /// was created, `false` if the user was already registered (the
    /// existing record is left untouched).
    fn add_participant(
        &self,
        trip_id: TripId,
        record: &ParticipantRecord,
    ) -> Result<bool, StorageError>;

    /// Whether a participant record exists for this trip and user.
    fn is_participant(&self, trip_id: TripId, user_id: UserId) -> Result<bool, StorageError>;
}
