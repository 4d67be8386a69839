//! Process-local [`BufferStore`].
//!
//! All keyed state sits behind one async mutex, which gives every operation
//! the same all-or-nothing visibility the Redis scripts provide. Pub/sub is a
//! `tokio::sync::broadcast` channel per chat.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::warn;

use spark_shared::{Chat, EventEnvelope, Message, MessagePatch};

use crate::error::Result;
use crate::store::{decode_entries, BufferStore};
use crate::subscription::{Subscription, SubscriptionOptions};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Expiring {
    value: String,
    expires_at: Instant,
}

impl Expiring {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> Option<&str> {
        (Instant::now() < self.expires_at).then_some(self.value.as_str())
    }
}

#[derive(Default)]
struct ChatState {
    entries: VecDeque<String>,
    last_activity_ts: Option<i64>,
    cache: Option<Expiring>,
    flush_token: Option<Expiring>,
}

#[derive(Default)]
struct Inner {
    chats: HashMap<String, ChatState>,
    /// chat id -> last activity (unix seconds)
    active: HashMap<String, i64>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn chat(&mut self, chat_id: &str) -> &mut ChatState {
        self.chats.entry(chat_id.to_string()).or_default()
    }

    fn channel(&mut self, chat_id: &str) -> &broadcast::Sender<String> {
        self.channels
            .entry(chat_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
    }

    /// Send to the chat's channel. A channel whose last receiver is gone is
    /// dropped; `subscribe` recreates it under the same lock.
    fn publish(&mut self, chat_id: &str, payload: String) {
        let Some(tx) = self.channels.get(chat_id) else {
            return;
        };
        if tx.receiver_count() == 0 {
            self.channels.remove(chat_id);
            return;
        }
        let _ = tx.send(payload);
    }

    /// Forget a chat that holds nothing: no entries, no live token, no
    /// live cache.
    fn prune(&mut self, chat_id: &str) {
        let idle = self.chats.get(chat_id).is_some_and(|c| {
            c.entries.is_empty()
                && c.flush_token.as_ref().and_then(Expiring::live).is_none()
                && c.cache.as_ref().and_then(Expiring::live).is_none()
        });
        if idle {
            self.chats.remove(chat_id);
        }
    }
}

/// In-memory buffer shared by every session in the process.
#[derive(Clone, Default)]
pub struct MemoryBuffer {
    inner: Arc<Mutex<Inner>>,
    options: SubscriptionOptions,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer whose subscriptions use `options` instead of the defaults.
    pub fn with_subscription_options(options: SubscriptionOptions) -> Self {
        Self {
            inner: Arc::default(),
            options,
        }
    }

    /// Last recorded activity for a chat, in unix seconds.
    pub async fn last_activity(&self, chat_id: &str) -> Option<i64> {
        let inner = self.inner.lock().await;
        inner.chats.get(chat_id).and_then(|c| c.last_activity_ts)
    }
}

#[async_trait]
impl BufferStore for MemoryBuffer {
    async fn append(
        &self,
        chat_id: &str,
        message: &Message,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let entry = serde_json::to_string(message)?;
        let payload = event.to_json()?;

        let mut inner = self.inner.lock().await;
        let chat = inner.chat(chat_id);
        chat.entries.push_back(entry);
        chat.last_activity_ts = Some(now.timestamp());
        let len = chat.entries.len();
        inner.active.insert(chat_id.to_string(), now.timestamp());
        inner.publish(chat_id, payload);
        Ok(len)
    }

    async fn buffered(&self, chat_id: &str) -> Result<Vec<Message>> {
        let entries: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .chats
                .get(chat_id)
                .map(|c| c.entries.iter().cloned().collect())
                .unwrap_or_default()
        };
        Ok(decode_entries(chat_id, entries))
    }

    async fn len(&self, chat_id: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.chats.get(chat_id).map_or(0, |c| c.entries.len()))
    }

    async fn update_buffered(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: &MessagePatch,
        now: DateTime<Utc>,
    ) -> Result<Option<(Message, bool)>> {
        let mut inner = self.inner.lock().await;
        let Some(chat) = inner.chats.get_mut(chat_id) else {
            return Ok(None);
        };

        for entry in chat.entries.iter_mut() {
            let mut message: Message = match serde_json::from_str(entry) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if message.id != message_id {
                continue;
            }
            let content_changed = patch.apply(&mut message, now);
            *entry = serde_json::to_string(&message)?;
            return Ok(Some((message, content_changed)));
        }
        Ok(None)
    }

    async fn pop_front(&self, chat_id: &str, count: usize) -> Result<Vec<Message>> {
        let popped: Vec<String> = {
            let mut inner = self.inner.lock().await;
            let popped = match inner.chats.get_mut(chat_id) {
                Some(chat) => {
                    let n = count.min(chat.entries.len());
                    chat.entries.drain(..n).collect()
                }
                None => Vec::new(),
            };
            inner.prune(chat_id);
            popped
        };
        Ok(decode_entries(chat_id, popped))
    }

    async fn push_front(&self, chat_id: &str, messages: &[Message]) -> Result<()> {
        let entries = messages
            .iter()
            .map(serde_json::to_string)
            .collect::<serde_json::Result<Vec<_>>>()?;

        let mut inner = self.inner.lock().await;
        let chat = inner.chat(chat_id);
        for entry in entries.into_iter().rev() {
            chat.entries.push_front(entry);
        }
        Ok(())
    }

    async fn publish(&self, chat_id: &str, event: &EventEnvelope) -> Result<()> {
        let payload = event.to_json()?;
        self.inner.lock().await.publish(chat_id, payload);
        Ok(())
    }

    async fn subscribe(&self, chat_id: &str) -> Result<Subscription> {
        let rx = self.inner.lock().await.channel(chat_id).subscribe();
        let owner = chat_id.to_string();

        let payloads = stream::unfold(rx, move |mut rx| {
            let owner = owner.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(chat_id = %owner, skipped, "subscriber lagged, events skipped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(Subscription::spawn(chat_id, payloads, self.options))
    }

    async fn cached_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let cached: Option<String> = {
            let inner = self.inner.lock().await;
            inner
                .chats
                .get(chat_id)
                .and_then(|c| c.cache.as_ref())
                .and_then(|c| c.live().map(str::to_string))
        };
        match cached {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn cache_chat(&self, chat: &Chat, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(chat)?;
        self.inner.lock().await.chat(&chat.id).cache = Some(Expiring::new(raw, ttl));
        Ok(())
    }

    async fn invalidate_chat(&self, chat_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(chat) = inner.chats.get_mut(chat_id) {
            chat.cache = None;
        }
        inner.prune(chat_id);
        Ok(())
    }

    async fn flush_token(&self, chat_id: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        let token = inner
            .chats
            .get(chat_id)
            .and_then(|c| c.flush_token.as_ref())
            .and_then(|t| t.live().map(str::to_string));
        if token.is_none() {
            inner.prune(chat_id);
        }
        Ok(token)
    }

    async fn set_flush_token(&self, chat_id: &str, token: &str, ttl: Duration) -> Result<()> {
        self.inner.lock().await.chat(chat_id).flush_token =
            Some(Expiring::new(token.to_string(), ttl));
        Ok(())
    }

    async fn active_chats(&self, idle_since: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = idle_since.timestamp();
        let inner = self.inner.lock().await;
        let mut idle: Vec<(i64, String)> = inner
            .active
            .iter()
            .filter(|(_, ts)| **ts <= cutoff)
            .map(|(id, ts)| (*ts, id.clone()))
            .collect();
        idle.sort();
        Ok(idle.into_iter().map(|(_, id)| id).collect())
    }

    async fn remove_active(&self, chat_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.active.remove(chat_id);
        inner.prune(chat_id);
        Ok(())
    }
}
