use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use spark_shared::{Chat, Message, MessagePatch};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Raw `chats` row before the timestamp and JSON column are decoded.
struct ChatRow {
    id: String,
    match_id: String,
    created_at: String,
    messages: String,
}

impl ChatRow {
    fn decode(self) -> Result<Chat> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc);
        let messages = decode_messages(&self.messages)?;
        Ok(Chat {
            id: self.id,
            match_id: self.match_id,
            created_at,
            messages,
        })
    }
}

/// Decode the `messages` column. Legacy rows may hold JSON `null`.
fn decode_messages(column: &str) -> Result<Vec<Message>> {
    let messages: Option<Vec<Message>> = serde_json::from_str(column)?;
    Ok(messages.unwrap_or_default())
}

impl Database {
    /// Create an empty chat for a match.
    pub fn insert_chat(&self, chat_id: &str, match_id: &str, created_at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chats (id, match_id, created_at, messages) VALUES (?1, ?2, ?3, '[]')",
            params![chat_id, match_id, created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load a chat joined against its owning match. A chat whose match is
    /// gone is reported as not found.
    pub fn get_chat(&self, chat_id: &str) -> Result<Chat> {
        let row = self
            .conn()
            .query_row(
                "SELECT c.id, c.match_id, c.created_at, c.messages
                 FROM chats c
                 JOIN matches m ON m.id = c.match_id
                 WHERE c.id = ?1",
                params![chat_id],
                |row| {
                    Ok(ChatRow {
                        id: row.get(0)?,
                        match_id: row.get(1)?,
                        created_at: row.get(2)?,
                        messages: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        row.decode()
    }

    /// Append messages to the chat's committed sequence in order, skipping
    /// any id that was already committed. Returns the number appended.
    ///
    /// Runs as one transaction: the `chat_message_ids` key and the
    /// `messages` column move together.
    pub fn append_messages(&self, chat_id: &str, messages: &[Message]) -> Result<usize> {
        let tx = self.conn().unchecked_transaction()?;

        let column: String = tx
            .query_row(
                "SELECT messages FROM chats WHERE id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        let mut committed = decode_messages(&column)?;

        let mut appended = 0;
        {
            let mut claim = tx.prepare(
                "INSERT OR IGNORE INTO chat_message_ids (chat_id, message_id) VALUES (?1, ?2)",
            )?;
            for message in messages {
                if claim.execute(params![chat_id, message.id])? == 0 {
                    tracing::debug!(chat_id, message_id = %message.id, "skipping already committed message");
                    continue;
                }
                committed.push(message.clone());
                appended += 1;
            }
        }

        if appended > 0 {
            tx.execute(
                "UPDATE chats SET messages = ?1 WHERE id = ?2",
                params![serde_json::to_string(&committed)?, chat_id],
            )?;
        }
        tx.commit()?;

        Ok(appended)
    }

    /// Merge a patch into one committed message. Returns the merged message
    /// and whether its content changed.
    pub fn update_message(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: &MessagePatch,
        now: DateTime<Utc>,
    ) -> Result<(Message, bool)> {
        let tx = self.conn().unchecked_transaction()?;

        let column: String = tx
            .query_row(
                "SELECT messages FROM chats WHERE id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        let mut committed = decode_messages(&column)?;

        let target = committed
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        let content_changed = patch.apply(target, now);
        let merged = target.clone();

        tx.execute(
            "UPDATE chats SET messages = ?1 WHERE id = ?2",
            params![serde_json::to_string(&committed)?, chat_id],
        )?;
        tx.commit()?;

        Ok((merged, content_changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.insert_match("m1", "she", "he").unwrap();
        db.insert_chat("c1", "m1", Utc::now()).unwrap();
        db
    }

    fn message(id: &str, content: &str) -> Message {
        let mut m = Message::text("she", content);
        m.id = id.to_string();
        m
    }

    #[test]
    fn test_get_missing_chat() {
        let db = seeded();
        assert!(db.get_chat("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_append_preserves_order_and_skips_duplicates() {
        let db = seeded();
        let appended = db
            .append_messages("c1", &[message("A", "1"), message("B", "2")])
            .unwrap();
        assert_eq!(appended, 2);

        // Overlapping drain: A is already committed.
        let appended = db
            .append_messages("c1", &[message("A", "1 again"), message("C", "3")])
            .unwrap();
        assert_eq!(appended, 1);

        let chat = db.get_chat("c1").unwrap();
        let ids: Vec<_> = chat.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(chat.messages[0].content, "1");
    }

    #[test]
    fn test_append_to_missing_chat_fails() {
        let db = seeded();
        let err = db.append_messages("ghost", &[message("A", "1")]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_update_committed_message() {
        let db = seeded();
        let original = message("A", "hello");
        db.append_messages("c1", &[original.clone()]).unwrap();

        let later = original.updated_at + Duration::seconds(10);
        let (merged, changed) = db
            .update_message("c1", "A", &MessagePatch::seen(), later)
            .unwrap();
        assert!(!changed);
        assert!(merged.seen && merged.received);
        assert_eq!(merged.updated_at, original.updated_at);

        let (merged, changed) = db
            .update_message("c1", "A", &MessagePatch::content("edited"), later)
            .unwrap();
        assert!(changed);
        assert_eq!(merged.updated_at, later);

        let stored = db.get_chat("c1").unwrap();
        assert_eq!(stored.messages[0].content, "edited");
        assert!(stored.messages[0].seen);
    }

    #[test]
    fn test_update_missing_message() {
        let db = seeded();
        let err = db
            .update_message("c1", "nope", &MessagePatch::seen(), Utc::now())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_null_messages_column_reads_as_empty() {
        let db = seeded();
        db.conn()
            .execute("UPDATE chats SET messages = 'null' WHERE id = 'c1'", [])
            .unwrap();

        assert!(db.get_chat("c1").unwrap().messages.is_empty());
        assert_eq!(db.append_messages("c1", &[message("A", "1")]).unwrap(), 1);
        let ids: Vec<_> = db
            .get_chat("c1")
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["A"]);
    }

    #[test]
    fn test_add_reaction_to_committed_message() {
        let db = seeded();
        db.append_messages("c1", &[message("A", "hello")]).unwrap();

        for sender in ["she", "he"] {
            let patch = MessagePatch::add_reaction(spark_shared::Reaction {
                id: format!("R-{sender}"),
                sender_id: sender.into(),
                content: "🔥".into(),
                created_at: Utc::now(),
            });
            db.update_message("c1", "A", &patch, Utc::now()).unwrap();
        }

        let stored = db.get_chat("c1").unwrap();
        assert_eq!(stored.messages[0].reactions.len(), 2);
    }
}
