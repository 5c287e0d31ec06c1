//! v001 -- Initial schema creation.
//!
//! Creates `rooms`, `room_participants`, `users` and `messages`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    invite_code TEXT NOT NULL UNIQUE,
    is_private  INTEGER NOT NULL DEFAULT 0,
    created_by  TEXT NOT NULL,                -- hex-encoded pubkey
    created_at  TEXT NOT NULL                 -- RFC-3339
);

-- ----------------------------------------------------------------
-- Room participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS room_participants (
    room_id    TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    username   TEXT NOT NULL,
    public_key TEXT NOT NULL,
    role       TEXT NOT NULL DEFAULT 'member', -- member | moderator | admin
    is_blocked INTEGER NOT NULL DEFAULT 0,
    joined_at  TEXT NOT NULL,

    PRIMARY KEY (room_id, user_id),
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,
    username   TEXT NOT NULL,
    public_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_seen  TEXT NOT NULL,
    is_blocked INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Messages (signed, append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id        TEXT PRIMARY KEY NOT NULL,      -- UUID v4
    room_id   TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    username  TEXT NOT NULL,
    content   TEXT NOT NULL,
    type      TEXT NOT NULL,
    encrypted INTEGER NOT NULL DEFAULT 0,
    timestamp TEXT NOT NULL,                  -- RFC-3339, microseconds
    signature TEXT NOT NULL DEFAULT '',

    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_id, timestamp DESC);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
