//! Records persisted by the store.
//!
//! Signed chat messages are stored as [`parley_shared::Message`] directly so
//! that what comes back out verifies against the original signature.

use chrono::{DateTime, Utc};
use parley_shared::{RoomId, Role};
use serde::{Deserialize, Serialize};

pub use parley_shared::Message;

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// Room row. Membership lives in [`ParticipantRecord`]s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    /// Unique across all rooms; regenerable.
    pub invite_code: String,
    pub is_private: bool,
    /// User id of the creator.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Link between a room and one of its members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub room_id: RoomId,
    pub user_id: String,
    pub username: String,
    pub public_key: String,
    pub role: Role,
    pub is_blocked: bool,
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
    /// Hex Ed25519 public key.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_blocked: bool,
}
