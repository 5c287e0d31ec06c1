use parley_shared::constants::DEFAULT_HISTORY_LIMIT;
use parley_shared::message::timestamp_micros;
use parley_shared::{MessageType, RoomId};
use rusqlite::params;

use crate::database::Database;
use crate::error::{column_error, not_found, parse_timestamp, Result};
use crate::models::Message;

const MESSAGE_COLUMNS: &str =
    "id, room_id, user_id, username, content, type, encrypted, timestamp, signature";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, room_id, user_id, username, content, type, encrypted, timestamp, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.to_string(),
                message.room_id.to_string(),
                message.user_id,
                message.username,
                message.content,
                message.kind.as_str(),
                message.encrypted,
                timestamp_micros::format(&message.timestamp),
                message.signature,
            ],
        )?;
        Ok(())
    }

    /// The `limit` most recent messages of a room, oldest first. A
    /// non-positive limit means [`DEFAULT_HISTORY_LIMIT`].
    pub fn get_messages_for_room(&self, room_id: RoomId, limit: i64) -> Result<Vec<Message>> {
        let limit = if limit <= 0 { DEFAULT_HISTORY_LIMIT } else { limit };
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![room_id.to_string(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn get_message_by_id(&self, id: uuid::Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let room_id: String = row.get(1)?;
    let kind: String = row.get(5)?;
    let timestamp: String = row.get(7)?;

    Ok(Message {
        id: uuid::Uuid::parse_str(&id).map_err(|e| column_error(0, e))?,
        room_id: room_id.parse().map_err(|e| column_error(1, e))?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        content: row.get(4)?,
        kind: kind.parse::<MessageType>().map_err(|e| column_error(5, e))?,
        encrypted: row.get(6)?,
        timestamp: parse_timestamp(7, &timestamp)?,
        signature: row.get(8)?,
    })
}
