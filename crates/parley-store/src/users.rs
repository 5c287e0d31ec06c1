use parley_shared::message::timestamp_micros;
use rusqlite::params;

use crate::database::Database;
use crate::error::{not_found, parse_timestamp, Result};
use crate::models::User;

impl Database {
    /// Insert a user or refresh the mutable fields of an existing one.
    /// `created_at` is kept from the first insert.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, username, public_key, created_at, last_seen, is_blocked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                public_key = excluded.public_key,
                last_seen = excluded.last_seen,
                is_blocked = excluded.is_blocked",
            params![
                user.id,
                user.username,
                user.public_key,
                timestamp_micros::format(&user.created_at),
                timestamp_micros::format(&user.last_seen),
                user.is_blocked,
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, username, public_key, created_at, last_seen, is_blocked
                 FROM users WHERE id = ?1",
                params![id],
                |row| {
                    let created_at: String = row.get(3)?;
                    let last_seen: String = row.get(4)?;
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        public_key: row.get(2)?,
                        created_at: parse_timestamp(3, &created_at)?,
                        last_seen: parse_timestamp(4, &last_seen)?,
                        is_blocked: row.get(5)?,
                    })
                },
            )
            .map_err(not_found)
    }
}
