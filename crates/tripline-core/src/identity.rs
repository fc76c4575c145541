//! Identity types.

/// Stable user identifier assigned by the account system.
pub type UserId = u64;

/// Trip identifier assigned by the trip planner.
pub type TripId = u64;

/// Authenticated identity attached to a live connection.
///
/// Membership decisions key on `user_id`; the display name is carried only
/// so broadcasts can embed the author name. It is resolved from the user
/// directory at authentication time rather than trusted from the
/// credential, so profile renames take effect on the next connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user id.
    pub user_id: UserId,
    /// Display name at authentication time.
    pub display_name: String,
}

impl Identity {
    /// Create a new identity.
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self { user_id, display_name: display_name.into() }
    }
}
