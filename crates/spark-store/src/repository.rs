//! Async access to the durable store.
//!
//! [`ChatRepository`] is the seam the chat server depends on. The SQLite
//! implementation serializes access to one connection and runs every call on
//! the blocking pool so no async worker waits on disk I/O.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use spark_shared::{Chat, Match, Message, MessagePatch};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::matches::CounterUpdate;

#[async_trait]
pub trait ChatRepository: Send + Sync + 'static {
    /// Load a chat with its committed messages.
    async fn load_chat(&self, chat_id: &str) -> Result<Chat>;

    async fn load_match(&self, match_id: &str) -> Result<Match>;

    /// Append messages in order, skipping already committed ids. Returns
    /// the number appended.
    async fn append_messages(&self, chat_id: &str, messages: Vec<Message>) -> Result<usize>;

    /// Merge a patch into a committed message. Returns the merged message
    /// and whether its content changed.
    async fn update_message(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<(Message, bool)>;

    /// Count one sent message against the match and unlock it at
    /// `threshold` messages per participant.
    async fn record_message_sent(
        &self,
        match_id: &str,
        sender_id: &str,
        threshold: i64,
    ) -> Result<CounterUpdate>;
}

/// [`ChatRepository`] over a shared SQLite [`Database`].
#[derive(Clone)]
pub struct SqliteRepository {
    db: Arc<Mutex<Database>>,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Task(format!("Lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ChatRepository for SqliteRepository {
    async fn load_chat(&self, chat_id: &str) -> Result<Chat> {
        let chat_id = chat_id.to_string();
        self.with_db(move |db| db.get_chat(&chat_id)).await
    }

    async fn load_match(&self, match_id: &str) -> Result<Match> {
        let match_id = match_id.to_string();
        self.with_db(move |db| db.get_match(&match_id)).await
    }

    async fn append_messages(&self, chat_id: &str, messages: Vec<Message>) -> Result<usize> {
        let chat_id = chat_id.to_string();
        self.with_db(move |db| db.append_messages(&chat_id, &messages))
            .await
    }

    async fn update_message(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<(Message, bool)> {
        let chat_id = chat_id.to_string();
        let message_id = message_id.to_string();
        self.with_db(move |db| db.update_message(&chat_id, &message_id, &patch, Utc::now()))
            .await
    }

    async fn record_message_sent(
        &self,
        match_id: &str,
        sender_id: &str,
        threshold: i64,
    ) -> Result<CounterUpdate> {
        let match_id = match_id.to_string();
        let sender_id = sender_id.to_string();
        self.with_db(move |db| db.record_message_sent(&match_id, &sender_id, threshold))
            .await
    }
}
