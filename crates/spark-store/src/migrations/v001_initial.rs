//! v001 -- Initial schema creation.
//!
//! Creates the two tables the chat engine reads and writes: `matches` and
//! `chats`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Matches (owned by the matching service; read for participants,
-- written for per-sender message counters and unlock)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS matches (
    id           TEXT PRIMARY KEY NOT NULL,
    she_id       TEXT NOT NULL,
    he_id        TEXT NOT NULL,
    she_messages INTEGER NOT NULL DEFAULT 0,
    he_messages  INTEGER NOT NULL DEFAULT 0,
    is_unlocked  INTEGER NOT NULL DEFAULT 0    -- boolean 0/1
);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id         TEXT PRIMARY KEY NOT NULL,
    match_id   TEXT NOT NULL,                  -- FK -> matches(id)
    created_at TEXT NOT NULL,                  -- RFC-3339
    messages   TEXT NOT NULL DEFAULT '[]',     -- JSON array, commit order

    FOREIGN KEY (match_id) REFERENCES matches(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chats_match_id ON chats(match_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
