use rusqlite::{params, OptionalExtension};

use spark_shared::Match;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Result of recording one sent message against a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    /// The match was unlocked before this message; nothing changed.
    AlreadyUnlocked,
    /// The sender's counter was incremented.
    Counted { sender_count: i64, other_count: i64 },
    /// The increment brought both counters to the threshold.
    Unlocked,
    /// The sender is not a participant of the match.
    NotParticipant,
}

impl Database {
    pub fn insert_match(&self, match_id: &str, she_id: &str, he_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO matches (id, she_id, he_id) VALUES (?1, ?2, ?3)",
            params![match_id, she_id, he_id],
        )?;
        Ok(())
    }

    pub fn get_match(&self, match_id: &str) -> Result<Match> {
        self.conn()
            .query_row(
                "SELECT id, she_id, he_id, she_messages, he_messages, is_unlocked
                 FROM matches WHERE id = ?1",
                params![match_id],
                |row| {
                    Ok(Match {
                        id: row.get(0)?,
                        she_id: row.get(1)?,
                        he_id: row.get(2)?,
                        she_messages: row.get(3)?,
                        he_messages: row.get(4)?,
                        is_unlocked: row.get(5)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("match {match_id}")))
    }

    /// Increment the sender's message counter and unlock the match once both
    /// participants have sent at least `threshold` messages.
    pub fn record_message_sent(
        &self,
        match_id: &str,
        sender_id: &str,
        threshold: i64,
    ) -> Result<CounterUpdate> {
        let tx = self.conn().unchecked_transaction()?;
        let current = self.get_match(match_id)?;

        if current.is_unlocked {
            return Ok(CounterUpdate::AlreadyUnlocked);
        }

        let (column, sender_count, other_count) = if sender_id == current.she_id {
            ("she_messages", current.she_messages + 1, current.he_messages)
        } else if sender_id == current.he_id {
            ("he_messages", current.he_messages + 1, current.she_messages)
        } else {
            return Ok(CounterUpdate::NotParticipant);
        };

        let unlock = sender_count >= threshold && other_count >= threshold;
        let sql = if unlock {
            format!("UPDATE matches SET {column} = {column} + 1, is_unlocked = 1 WHERE id = ?1")
        } else {
            format!("UPDATE matches SET {column} = {column} + 1 WHERE id = ?1")
        };
        tx.execute(&sql, params![match_id])?;
        tx.commit()?;

        if unlock {
            tracing::info!(match_id, "match unlocked by message count");
            Ok(CounterUpdate::Unlocked)
        } else {
            Ok(CounterUpdate::Counted {
                sender_count,
                other_count,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments_sender_column() {
        let db = Database::open_in_memory().unwrap();
        db.insert_match("m1", "she", "he").unwrap();

        let update = db.record_message_sent("m1", "he", 50).unwrap();
        assert_eq!(
            update,
            CounterUpdate::Counted {
                sender_count: 1,
                other_count: 0
            }
        );
        let m = db.get_match("m1").unwrap();
        assert_eq!(m.he_messages, 1);
        assert_eq!(m.she_messages, 0);
    }

    #[test]
    fn test_unlock_when_both_cross_threshold() {
        let db = Database::open_in_memory().unwrap();
        db.insert_match("m1", "she", "he").unwrap();

        for _ in 0..3 {
            db.record_message_sent("m1", "she", 3).unwrap();
        }
        for _ in 0..2 {
            assert!(matches!(
                db.record_message_sent("m1", "he", 3).unwrap(),
                CounterUpdate::Counted { .. }
            ));
        }
        assert_eq!(
            db.record_message_sent("m1", "he", 3).unwrap(),
            CounterUpdate::Unlocked
        );
        assert!(db.get_match("m1").unwrap().is_unlocked);
        assert_eq!(
            db.record_message_sent("m1", "she", 3).unwrap(),
            CounterUpdate::AlreadyUnlocked
        );
    }

    #[test]
    fn test_stranger_is_not_counted() {
        let db = Database::open_in_memory().unwrap();
        db.insert_match("m1", "she", "he").unwrap();
        assert_eq!(
            db.record_message_sent("m1", "eve", 50).unwrap(),
            CounterUpdate::NotParticipant
        );
    }
}
