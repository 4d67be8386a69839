use rusqlite::Connection;

// One row per committed message. Written in the same transaction as the
// `messages` column so an id can be committed at most once per chat.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chat_message_ids (
    chat_id    TEXT NOT NULL,                  -- FK -> chats(id)
    message_id TEXT NOT NULL,

    PRIMARY KEY (chat_id, message_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

INSERT OR IGNORE INTO chat_message_ids (chat_id, message_id)
SELECT chats.id, json_extract(entry.value, '$.id')
FROM chats, json_each(chats.messages) AS entry
WHERE json_extract(entry.value, '$.id') IS NOT NULL;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
