use std::path::Path;

use parking_lot::Mutex;
use parley_shared::RoomId;

use crate::database::Database;
use crate::error::Result;
use crate::models::{Message, ParticipantRecord, RoomRecord, User};

/// Narrow persistence interface used by the server. Lookups of a missing
/// key fail with [`StoreError::NotFound`](crate::StoreError::NotFound).
pub trait Storage: Send + Sync {
    /// Insert or update a room row.
    fn save_room(&self, room: &RoomRecord) -> Result<()>;
    fn get_room(&self, id: RoomId) -> Result<RoomRecord>;
    fn get_room_by_invite_code(&self, code: &str) -> Result<RoomRecord>;
    fn list_rooms(&self) -> Result<Vec<RoomRecord>>;

    fn add_participant(&self, participant: &ParticipantRecord) -> Result<()>;
    fn update_participant(&self, participant: &ParticipantRecord) -> Result<()>;
    fn remove_participant(&self, room_id: RoomId, user_id: &str) -> Result<()>;
    fn list_participants(&self, room_id: RoomId) -> Result<Vec<ParticipantRecord>>;

    fn save_message(&self, message: &Message) -> Result<()>;
    /// Most recent `limit` messages, oldest first; `limit <= 0` means 50.
    fn get_messages(&self, room_id: RoomId, limit: i64) -> Result<Vec<Message>>;

    fn save_user(&self, user: &User) -> Result<()>;
    fn get_user(&self, id: &str) -> Result<User>;
}

/// [`Storage`] over a single SQLite connection.
pub struct SqliteStorage {
    db: Mutex<Database>,
}

impl SqliteStorage {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open_in_dir(dir: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_in_dir(dir)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }
}

impl Storage for SqliteStorage {
    fn save_room(&self, room: &RoomRecord) -> Result<()> {
        self.db.lock().upsert_room(room)
    }

    fn get_room(&self, id: RoomId) -> Result<RoomRecord> {
        self.db.lock().get_room(id)
    }

    fn get_room_by_invite_code(&self, code: &str) -> Result<RoomRecord> {
        self.db.lock().get_room_by_invite_code(code)
    }

    fn list_rooms(&self) -> Result<Vec<RoomRecord>> {
        self.db.lock().list_rooms()
    }

    fn add_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        self.db.lock().insert_participant(participant)
    }

    fn update_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        self.db.lock().update_participant(participant)
    }

    fn remove_participant(&self, room_id: RoomId, user_id: &str) -> Result<()> {
        self.db.lock().delete_participant(room_id, user_id)
    }

    fn list_participants(&self, room_id: RoomId) -> Result<Vec<ParticipantRecord>> {
        self.db.lock().list_participants(room_id)
    }

    fn save_message(&self, message: &Message) -> Result<()> {
        self.db.lock().insert_message(message)
    }

    fn get_messages(&self, room_id: RoomId, limit: i64) -> Result<Vec<Message>> {
        self.db.lock().get_messages_for_room(room_id, limit)
    }

    fn save_user(&self, user: &User) -> Result<()> {
        self.db.lock().upsert_user(user)
    }

    fn get_user(&self, id: &str) -> Result<User> {
        self.db.lock().get_user(id)
    }
}
