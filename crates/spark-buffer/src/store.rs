use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use spark_shared::{Chat, EventEnvelope, Message, MessagePatch};

use crate::error::Result;
use crate::subscription::Subscription;

/// Operations on the fast shared store.
///
/// Implementations must make `append`, `update_buffered`, `pop_front` and
/// `push_front` atomic with respect to each other: no caller may observe a
/// buffer half way through one of them.
#[async_trait]
pub trait BufferStore: Send + Sync + 'static {
    /// Append a message to the chat's buffer, publish `event` on its channel
    /// and record `now` as its last activity, as one transaction. Returns the
    /// buffer length after the append.
    async fn append(
        &self,
        chat_id: &str,
        message: &Message,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// All buffered messages in FIFO order.
    async fn buffered(&self, chat_id: &str) -> Result<Vec<Message>>;

    async fn len(&self, chat_id: &str) -> Result<usize>;

    /// Merge a patch into a buffered message in place. `None` when the id is
    /// not buffered. On a hit, returns the merged message and whether its
    /// content changed.
    async fn update_buffered(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: &MessagePatch,
        now: DateTime<Utc>,
    ) -> Result<Option<(Message, bool)>>;

    /// Remove and return up to `count` entries from the head.
    async fn pop_front(&self, chat_id: &str, count: usize) -> Result<Vec<Message>>;

    /// Put messages back at the head, keeping their order.
    async fn push_front(&self, chat_id: &str, messages: &[Message]) -> Result<()>;

    async fn publish(&self, chat_id: &str, event: &EventEnvelope) -> Result<()>;

    async fn subscribe(&self, chat_id: &str) -> Result<Subscription>;

    async fn cached_chat(&self, chat_id: &str) -> Result<Option<Chat>>;

    async fn cache_chat(&self, chat: &Chat, ttl: Duration) -> Result<()>;

    async fn invalidate_chat(&self, chat_id: &str) -> Result<()>;

    async fn flush_token(&self, chat_id: &str) -> Result<Option<String>>;

    async fn set_flush_token(&self, chat_id: &str, token: &str, ttl: Duration) -> Result<()>;

    /// Chats whose last activity is at or before `idle_since`.
    async fn active_chats(&self, idle_since: DateTime<Utc>) -> Result<Vec<String>>;

    async fn remove_active(&self, chat_id: &str) -> Result<()>;
}

/// Decode buffer entries, dropping the ones that no longer parse.
pub(crate) fn decode_entries(chat_id: &str, entries: Vec<String>) -> Vec<Message> {
    entries
        .into_iter()
        .filter_map(|raw| match serde_json::from_str::<Message>(&raw) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "dropping unparseable buffer entry");
                None
            }
        })
        .collect()
}
