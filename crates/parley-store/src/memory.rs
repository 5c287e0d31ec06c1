use std::collections::HashMap;

use parking_lot::RwLock;
use parley_shared::constants::DEFAULT_HISTORY_LIMIT;
use parley_shared::RoomId;

use crate::error::{Result, StoreError};
use crate::models::{Message, ParticipantRecord, RoomRecord, User};
use crate::storage::Storage;

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomId, RoomRecord>,
    participants: HashMap<RoomId, Vec<ParticipantRecord>>,
    messages: HashMap<RoomId, Vec<Message>>,
    users: HashMap<String, User>,
}

/// Non-durable [`Storage`], for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn save_room(&self, room: &RoomRecord) -> Result<()> {
        self.tables.write().rooms.insert(room.id, room.clone());
        Ok(())
    }

    fn get_room(&self, id: RoomId) -> Result<RoomRecord> {
        self.tables.read().rooms.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    fn get_room_by_invite_code(&self, code: &str) -> Result<RoomRecord> {
        self.tables
            .read()
            .rooms
            .values()
            .find(|r| r.invite_code == code)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn list_rooms(&self) -> Result<Vec<RoomRecord>> {
        let mut rooms: Vec<_> = self.tables.read().rooms.values().cloned().collect();
        rooms.sort_by_key(|r| r.created_at);
        Ok(rooms)
    }

    fn add_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        let mut tables = self.tables.write();
        let list = tables.participants.entry(participant.room_id).or_default();
        list.retain(|p| p.user_id != participant.user_id);
        list.push(participant.clone());
        Ok(())
    }

    fn update_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        let mut tables = self.tables.write();
        let existing = tables
            .participants
            .get_mut(&participant.room_id)
            .and_then(|list| list.iter_mut().find(|p| p.user_id == participant.user_id))
            .ok_or(StoreError::NotFound)?;
        existing.role = participant.role;
        existing.is_blocked = participant.is_blocked;
        existing.username = participant.username.clone();
        Ok(())
    }

    fn remove_participant(&self, room_id: RoomId, user_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let list = tables.participants.get_mut(&room_id).ok_or(StoreError::NotFound)?;
        let before = list.len();
        list.retain(|p| p.user_id != user_id);
        if list.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn list_participants(&self, room_id: RoomId) -> Result<Vec<ParticipantRecord>> {
        Ok(self
            .tables
            .read()
            .participants
            .get(&room_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.tables.write();
        let list = tables.messages.entry(message.room_id).or_default();
        let at = list.partition_point(|m| m.timestamp <= message.timestamp);
        list.insert(at, message.clone());
        Ok(())
    }

    fn get_messages(&self, room_id: RoomId, limit: i64) -> Result<Vec<Message>> {
        let limit = (if limit <= 0 { DEFAULT_HISTORY_LIMIT } else { limit }) as usize;
        let tables = self.tables.read();
        let Some(list) = tables.messages.get(&room_id) else {
            return Ok(Vec::new());
        };
        let start = list.len().saturating_sub(limit);
        Ok(list[start..].to_vec())
    }

    fn save_user(&self, user: &User) -> Result<()> {
        self.tables
            .write()
            .users
            .entry(user.id.clone())
            .and_modify(|existing| {
                let created_at = existing.created_at;
                *existing = user.clone();
                existing.created_at = created_at;
            })
            .or_insert_with(|| user.clone());
        Ok(())
    }

    fn get_user(&self, id: &str) -> Result<User> {
        self.tables.read().users.get(id).cloned().ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_contract() {
        crate::storage::tests::exercise(&MemoryStorage::new());
    }
}
