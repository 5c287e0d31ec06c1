use parley_shared::message::timestamp_micros;
use parley_shared::{RoomId, Role};
use rusqlite::params;

use crate::database::Database;
use crate::error::{column_error, not_found, parse_timestamp, Result, StoreError};
use crate::models::{ParticipantRecord, RoomRecord};

const ROOM_COLUMNS: &str = "id, name, description, invite_code, is_private, created_by, created_at";
const PARTICIPANT_COLUMNS: &str =
    "room_id, user_id, username, public_key, role, is_blocked, joined_at";

impl Database {
    /// Insert a room, or update it in place if the id already exists.
    pub fn upsert_room(&self, room: &RoomRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO rooms (id, name, description, invite_code, is_private, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                invite_code = excluded.invite_code,
                is_private = excluded.is_private",
            params![
                room.id.to_string(),
                room.name,
                room.description,
                room.invite_code,
                room.is_private,
                room.created_by,
                timestamp_micros::format(&room.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_room(&self, id: RoomId) -> Result<RoomRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"),
                params![id.to_string()],
                row_to_room,
            )
            .map_err(not_found)
    }

    pub fn get_room_by_invite_code(&self, code: &str) -> Result<RoomRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE invite_code = ?1"),
                params![code],
                row_to_room,
            )
            .map_err(not_found)
    }

    pub fn list_rooms(&self) -> Result<Vec<RoomRecord>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {ROOM_COLUMNS} FROM rooms ORDER BY created_at ASC"))?;
        let rows = stmt.query_map([], row_to_room)?;

        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }

    pub fn insert_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO room_participants (room_id, user_id, username, public_key, role, is_blocked, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                participant.room_id.to_string(),
                participant.user_id,
                participant.username,
                participant.public_key,
                participant.role.as_str(),
                participant.is_blocked,
                timestamp_micros::format(&participant.joined_at),
            ],
        )?;
        Ok(())
    }

    /// Persist a participant's role and block flag.
    pub fn update_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE room_participants SET role = ?3, is_blocked = ?4, username = ?5
             WHERE room_id = ?1 AND user_id = ?2",
            params![
                participant.room_id.to_string(),
                participant.user_id,
                participant.role.as_str(),
                participant.is_blocked,
                participant.username,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn delete_participant(&self, room_id: RoomId, user_id: &str) -> Result<()> {
        let affected = self.conn().execute(
            "DELETE FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
            params![room_id.to_string(), user_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn list_participants(&self, room_id: RoomId) -> Result<Vec<ParticipantRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM room_participants
             WHERE room_id = ?1 ORDER BY joined_at ASC"
        ))?;
        let rows = stmt.query_map(params![room_id.to_string()], row_to_participant)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRecord> {
    let id_str: String = row.get(0)?;
    let created_at: String = row.get(6)?;

    Ok(RoomRecord {
        id: id_str.parse().map_err(|e| column_error(0, e))?,
        name: row.get(1)?,
        description: row.get(2)?,
        invite_code: row.get(3)?,
        is_private: row.get(4)?,
        created_by: row.get(5)?,
        created_at: parse_timestamp(6, &created_at)?,
    })
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantRecord> {
    let room_id: String = row.get(0)?;
    let role: String = row.get(4)?;
    let joined_at: String = row.get(6)?;

    Ok(ParticipantRecord {
        room_id: room_id.parse().map_err(|e| column_error(0, e))?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        public_key: row.get(3)?,
        role: role.parse::<Role>().map_err(|e| column_error(4, e))?,
        is_blocked: row.get(5)?,
        joined_at: parse_timestamp(6, &joined_at)?,
    })
}
