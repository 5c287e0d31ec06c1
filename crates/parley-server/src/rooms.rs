//! Room membership authority.
//!
//! Owns every room known to this node together with its members, roles,
//! block flags and invite code. One [`RwLock`] guards the room table and the
//! invite-code index, so an index entry is always written in the same
//! critical section as the room it points to. Mutations are persisted before
//! they are applied in memory; a storage failure leaves the table untouched.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use parley_shared::constants::{INVITE_CODE_BYTES, MAX_DESCRIPTION_CHARS, MAX_ROOM_NAME_CHARS};
use parley_shared::message::now_micros;
use parley_shared::{RoomId, Role};
use parley_store::{ParticipantRecord, RoomRecord, Storage, StoreError};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Attempts at drawing an unused invite code before giving up.
const INVITE_CODE_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("already a member of this room")]
    AlreadyMember,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub username: String,
    pub public_key: String,
    pub joined_at: DateTime<Utc>,
    pub role: Role,
    pub is_blocked: bool,
}

impl Member {
    fn record(&self, room_id: RoomId) -> ParticipantRecord {
        ParticipantRecord {
            room_id,
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            public_key: self.public_key.clone(),
            role: self.role,
            is_blocked: self.is_blocked,
            joined_at: self.joined_at,
        }
    }
}

impl From<ParticipantRecord> for Member {
    fn from(p: ParticipantRecord) -> Self {
        Self {
            user_id: p.user_id,
            username: p.username,
            public_key: p.public_key,
            joined_at: p.joined_at,
            role: p.role,
            is_blocked: p.is_blocked,
        }
    }
}

/// Snapshot of a room. Every id in `moderators` is also a key of `members`.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub invite_code: String,
    pub is_private: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub members: HashMap<String, Member>,
    pub moderators: BTreeSet<String>,
}

impl Room {
    fn record(&self) -> RoomRecord {
        RoomRecord {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            invite_code: self.invite_code.clone(),
            is_private: self.is_private,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
        }
    }

    fn from_records(record: RoomRecord, participants: Vec<ParticipantRecord>) -> Self {
        let members: HashMap<String, Member> = participants
            .into_iter()
            .map(|p| (p.user_id.clone(), Member::from(p)))
            .collect();
        let moderators = members
            .values()
            .filter(|m| m.role.can_moderate())
            .map(|m| m.user_id.clone())
            .collect();
        Self {
            id: record.id,
            name: record.name,
            description: record.description,
            invite_code: record.invite_code,
            is_private: record.is_private,
            created_by: record.created_by,
            created_at: record.created_at,
            members,
            moderators,
        }
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.get(user_id)
    }

    pub fn is_moderator(&self, user_id: &str) -> bool {
        self.moderators.contains(user_id)
    }

    fn sync_moderator(&mut self, user_id: &str, role: Role) {
        if role.can_moderate() {
            self.moderators.insert(user_id.to_string());
        } else {
            self.moderators.remove(user_id);
        }
    }
}

/// Wire view of a room; members sorted by join time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomView {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub invite_code: String,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
    pub members: Vec<Member>,
    pub moderators: Vec<String>,
}

impl From<&Room> for RoomView {
    fn from(room: &Room) -> Self {
        let mut members: Vec<Member> = room.members.values().cloned().collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
        Self {
            id: room.id,
            name: room.name.clone(),
            description: room.description.clone(),
            invite_code: room.invite_code.clone(),
            is_private: room.is_private,
            created_at: room.created_at,
            members,
            moderators: room.moderators.iter().cloned().collect(),
        }
    }
}

#[derive(Default)]
struct RoomTable {
    rooms: HashMap<RoomId, Room>,
    by_invite: HashMap<String, RoomId>,
}

impl RoomTable {
    fn insert(&mut self, room: Room) {
        self.by_invite.insert(room.invite_code.clone(), room.id);
        self.rooms.insert(room.id, room);
    }
}

pub struct RoomAuthority {
    table: RwLock<RoomTable>,
    storage: Arc<dyn Storage>,
}

impl RoomAuthority {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            table: RwLock::new(RoomTable::default()),
            storage,
        }
    }

    /// Load every persisted room into memory. Returns the number loaded.
    pub fn load(&self) -> Result<usize, RoomError> {
        let records = self.storage.list_rooms()?;
        let mut table = self.table.write();
        for record in records {
            let participants = self.storage.list_participants(record.id)?;
            table.insert(Room::from_records(record, participants));
        }
        Ok(table.rooms.len())
    }

    /// Create a room owned by `creator_id`, who becomes its admin.
    pub fn create_room(
        &self,
        name: &str,
        description: &str,
        is_private: bool,
        creator_id: &str,
        creator_username: &str,
        creator_public_key: &str,
    ) -> Result<Room, RoomError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RoomError::Validation("room name is required".into()));
        }
        if name.chars().count() > MAX_ROOM_NAME_CHARS {
            return Err(RoomError::Validation(format!(
                "room name exceeds {MAX_ROOM_NAME_CHARS} characters"
            )));
        }
        let description = description.trim();
        if description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(RoomError::Validation(format!(
                "description exceeds {MAX_DESCRIPTION_CHARS} characters"
            )));
        }
        if creator_id.is_empty() {
            return Err(RoomError::Validation("creator id is required".into()));
        }

        let mut table = self.table.write();
        let invite_code = self.unused_invite_code(&table)?;
        let now = now_micros();
        let creator = Member {
            user_id: creator_id.to_string(),
            username: creator_username.to_string(),
            public_key: creator_public_key.to_string(),
            joined_at: now,
            role: Role::Admin,
            is_blocked: false,
        };
        let room = Room {
            id: RoomId::new(),
            name: name.to_string(),
            description: description.to_string(),
            invite_code,
            is_private,
            created_by: creator_id.to_string(),
            created_at: now,
            members: HashMap::from([(creator.user_id.clone(), creator.clone())]),
            moderators: BTreeSet::from([creator.user_id.clone()]),
        };

        self.storage.save_room(&room.record())?;
        self.storage.add_participant(&creator.record(room.id))?;
        table.insert(room.clone());

        info!(room = %room.id, name = %room.name, creator = %creator_username, "Room created");
        Ok(room)
    }

    /// Add a user to the room owning `code`.
    pub fn join_by_invite(
        &self,
        code: &str,
        user_id: &str,
        username: &str,
        public_key: &str,
    ) -> Result<Room, RoomError> {
        let code = code.trim();
        let mut table = self.table.write();
        let known = table.by_invite.get(code).copied();
        let room_id = match known {
            Some(id) => id,
            None => match self.storage.get_room_by_invite_code(code) {
                Ok(record) => {
                    let id = record.id;
                    self.load_into(&mut table, record)?;
                    id
                }
                Err(StoreError::NotFound) => return Err(RoomError::NotFound("invite code")),
                Err(e) => return Err(e.into()),
            },
        };
        let room = table
            .rooms
            .get_mut(&room_id)
            .ok_or(RoomError::NotFound("room"))?;
        if room.members.contains_key(user_id) {
            return Err(RoomError::AlreadyMember);
        }

        let member = Member {
            user_id: user_id.to_string(),
            username: username.to_string(),
            public_key: public_key.to_string(),
            joined_at: now_micros(),
            role: Role::Member,
            is_blocked: false,
        };
        self.storage.add_participant(&member.record(room_id))?;
        room.members.insert(member.user_id.clone(), member);

        info!(room = %room_id, user = %username, members = room.members.len(), "Member joined by invite");
        Ok(room.clone())
    }

    /// Remove a member and any moderator flag they held.
    pub fn leave(&self, room_id: RoomId, user_id: &str) -> Result<Member, RoomError> {
        let mut table = self.table.write();
        let room = self.room_mut(&mut table, room_id)?;
        if !room.members.contains_key(user_id) {
            return Err(RoomError::NotFound("member"));
        }

        match self.storage.remove_participant(room_id, user_id) {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        room.moderators.remove(user_id);
        let member = room
            .members
            .remove(user_id)
            .ok_or(RoomError::NotFound("member"))?;

        info!(room = %room_id, user = %member.username, "Member left room");
        Ok(member)
    }

    /// Change a member's role. Authorization is the caller's job.
    pub fn set_role(&self, room_id: RoomId, user_id: &str, role: Role) -> Result<Member, RoomError> {
        self.update_member(room_id, user_id, |member| member.role = role)
    }

    /// Set or clear a member's block flag. Authorization is the caller's job.
    pub fn set_blocked(
        &self,
        room_id: RoomId,
        user_id: &str,
        blocked: bool,
    ) -> Result<Member, RoomError> {
        self.update_member(room_id, user_id, |member| member.is_blocked = blocked)
    }

    fn update_member(
        &self,
        room_id: RoomId,
        user_id: &str,
        apply: impl FnOnce(&mut Member),
    ) -> Result<Member, RoomError> {
        let mut table = self.table.write();
        let room = self.room_mut(&mut table, room_id)?;
        let mut member = room
            .members
            .get(user_id)
            .cloned()
            .ok_or(RoomError::NotFound("member"))?;

        apply(&mut member);
        self.storage.update_participant(&member.record(room_id))?;
        room.sync_moderator(&member.user_id, member.role);
        room.members.insert(member.user_id.clone(), member.clone());

        debug!(
            room = %room_id,
            user = %member.username,
            role = %member.role,
            blocked = member.is_blocked,
            "Member updated"
        );
        Ok(member)
    }

    /// Replace a room's invite code; the old code stops working immediately.
    pub fn regenerate_invite_code(&self, room_id: RoomId) -> Result<String, RoomError> {
        let mut table = self.table.write();
        self.room_mut(&mut table, room_id)?;
        let code = self.unused_invite_code(&table)?;

        let room = table
            .rooms
            .get_mut(&room_id)
            .ok_or(RoomError::NotFound("room"))?;
        let mut record = room.record();
        record.invite_code = code.clone();
        self.storage.save_room(&record)?;

        let old = std::mem::replace(&mut room.invite_code, code.clone());
        table.by_invite.remove(&old);
        table.by_invite.insert(code.clone(), room_id);

        info!(room = %room_id, "Invite code regenerated");
        Ok(code)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_room(&self, room_id: RoomId) -> Result<Room, RoomError> {
        if let Some(room) = self.table.read().rooms.get(&room_id) {
            return Ok(room.clone());
        }
        let mut table = self.table.write();
        self.room_mut(&mut table, room_id).map(|room| room.clone())
    }

    pub fn room_by_invite_code(&self, code: &str) -> Result<Room, RoomError> {
        let table = self.table.read();
        table
            .by_invite
            .get(code.trim())
            .and_then(|id| table.rooms.get(id))
            .cloned()
            .ok_or(RoomError::NotFound("invite code"))
    }

    /// All loaded rooms, oldest first.
    pub fn list_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.table.read().rooms.values().cloned().collect();
        rooms.sort_by_key(|r| r.created_at);
        rooms
    }

    pub fn member(&self, room_id: RoomId, user_id: &str) -> Result<Member, RoomError> {
        self.get_room(room_id)?
            .members
            .remove(user_id)
            .ok_or(RoomError::NotFound("member"))
    }

    pub fn is_member(&self, room_id: RoomId, user_id: &str) -> bool {
        self.table
            .read()
            .rooms
            .get(&room_id)
            .is_some_and(|room| room.members.contains_key(user_id))
    }

    pub fn find_member_by_username(&self, room_id: RoomId, username: &str) -> Option<Member> {
        self.table
            .read()
            .rooms
            .get(&room_id)?
            .members
            .values()
            .find(|m| m.username == username)
            .cloned()
    }

    pub fn room_count(&self) -> usize {
        self.table.read().rooms.len()
    }

    // -----------------------------------------------------------------------
    // Internals (callers hold the write lock)
    // -----------------------------------------------------------------------

    fn room_mut<'t>(&self, table: &'t mut RoomTable, room_id: RoomId) -> Result<&'t mut Room, RoomError> {
        if !table.rooms.contains_key(&room_id) {
            let record = match self.storage.get_room(room_id) {
                Ok(record) => record,
                Err(StoreError::NotFound) => return Err(RoomError::NotFound("room")),
                Err(e) => return Err(e.into()),
            };
            self.load_into(table, record)?;
        }
        table.rooms.get_mut(&room_id).ok_or(RoomError::NotFound("room"))
    }

    fn load_into(&self, table: &mut RoomTable, record: RoomRecord) -> Result<(), RoomError> {
        let participants = self.storage.list_participants(record.id)?;
        debug!(room = %record.id, members = participants.len(), "Loaded room from storage");
        table.insert(Room::from_records(record, participants));
        Ok(())
    }

    fn unused_invite_code(&self, table: &RoomTable) -> Result<String, RoomError> {
        for _ in 0..INVITE_CODE_ATTEMPTS {
            let code = generate_invite_code();
            if table.by_invite.contains_key(&code) {
                continue;
            }
            match self.storage.get_room_by_invite_code(&code) {
                Err(StoreError::NotFound) => return Ok(code),
                Ok(_) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(RoomError::Validation("could not allocate an invite code".into()))
    }
}

/// 12 bytes from the OS RNG, base64url encoded (16 characters).
pub fn generate_invite_code() -> String {
    let mut bytes = [0u8; INVITE_CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
