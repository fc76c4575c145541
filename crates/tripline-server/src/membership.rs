//! Trip membership authorization.
//!
//! A user may read or write a trip's chat iff, at the moment of the check,
//! they own the trip or hold a participant registration for it. The check
//! runs against storage on every privileged operation (join, send, history
//! fetch, offline post); membership can change mid-session, so results are
//! never cached.
//!
//! Membership keys on the stable user id. The display name stored on a
//! participant record is presentation only and plays no part in the
//! decision.

use thiserror::Error;
use tripline_core::{Identity, TripId, UserId};

use crate::storage::{ParticipantRecord, Storage, StorageError};

/// Errors from membership checks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// The trip does not exist.
    #[error("trip not found: {0}")]
    TripNotFound(TripId),

    /// Storage lookup failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// True iff `user_id` owns the trip or is a registered participant.
pub fn is_member<S: Storage>(
    storage: &S,
    trip_id: TripId,
    user_id: UserId,
) -> Result<bool, MembershipError> {
    let trip = storage.load_trip(trip_id)?.ok_or(MembershipError::TripNotFound(trip_id))?;

    if trip.owner_id == user_id {
        return Ok(true);
    }

    Ok(storage.is_participant(trip_id, user_id)?)
}

/// Register `identity` as a participant of `trip_id`.
///
/// Idempotent: returns `true` if a new registration was created, `false` if
/// the user was already registered (a no-op success). The trip owner may
/// register too; it changes nothing about their access.
pub fn register_participant<S: Storage>(
    storage: &S,
    trip_id: TripId,
    identity: &Identity,
    now_secs: u64,
) -> Result<bool, MembershipError> {
    if storage.load_trip(trip_id)?.is_none() {
        return Err(MembershipError::TripNotFound(trip_id));
    }

    let record = ParticipantRecord {
        user_id: identity.user_id,
        display_name: identity.display_name.clone(),
        joined_at_secs: now_secs,
    };

    Ok(storage.add_participant(trip_id, &record)?)
}
