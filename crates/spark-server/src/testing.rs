//! Shared fixtures for server tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use spark_buffer::{BufferError, BufferStore, MemoryBuffer, Subscription};
use spark_shared::{Chat, EventEnvelope, Match, Message, MessagePatch};
use spark_store::{ChatRepository, CounterUpdate, Database, SqliteRepository, StoreError};

use crate::flush::{FlushCoordinator, FlushSettings};
use crate::scheduler::RecordingScheduler;
use crate::session::ChatServices;

/// SQLite repository whose appends can be made to fail.
pub struct FlakyRepo {
    inner: SqliteRepository,
    fail: AtomicBool,
    appends: AtomicUsize,
}

impl FlakyRepo {
    pub fn fail_appends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Successful append calls so far.
    pub fn append_calls(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatRepository for FlakyRepo {
    async fn load_chat(&self, chat_id: &str) -> spark_store::Result<Chat> {
        self.inner.load_chat(chat_id).await
    }

    async fn load_match(&self, match_id: &str) -> spark_store::Result<Match> {
        self.inner.load_match(match_id).await
    }

    async fn append_messages(
        &self,
        chat_id: &str,
        messages: Vec<Message>,
    ) -> spark_store::Result<usize> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Task("injected failure".into()));
        }
        let n = self.inner.append_messages(chat_id, messages).await?;
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(n)
    }

    async fn update_message(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> spark_store::Result<(Message, bool)> {
        self.inner.update_message(chat_id, message_id, patch).await
    }

    async fn record_message_sent(
        &self,
        match_id: &str,
        sender_id: &str,
        threshold: i64,
    ) -> spark_store::Result<CounterUpdate> {
        self.inner
            .record_message_sent(match_id, sender_id, threshold)
            .await
    }
}

/// Memory buffer sharing another buffer's state, whose token writes can be
/// made to fail.
pub struct TokenlessBuffer {
    inner: MemoryBuffer,
    fail: AtomicBool,
}

impl TokenlessBuffer {
    pub fn new(shared: &MemoryBuffer) -> Self {
        Self {
            inner: shared.clone(),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail_tokens(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BufferStore for TokenlessBuffer {
    async fn append(
        &self,
        chat_id: &str,
        message: &Message,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> spark_buffer::Result<usize> {
        self.inner.append(chat_id, message, event, now).await
    }

    async fn buffered(&self, chat_id: &str) -> spark_buffer::Result<Vec<Message>> {
        self.inner.buffered(chat_id).await
    }

    async fn len(&self, chat_id: &str) -> spark_buffer::Result<usize> {
        self.inner.len(chat_id).await
    }

    async fn update_buffered(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: &MessagePatch,
        now: DateTime<Utc>,
    ) -> spark_buffer::Result<Option<(Message, bool)>> {
        self.inner.update_buffered(chat_id, message_id, patch, now).await
    }

    async fn pop_front(&self, chat_id: &str, count: usize) -> spark_buffer::Result<Vec<Message>> {
        self.inner.pop_front(chat_id, count).await
    }

    async fn push_front(&self, chat_id: &str, messages: &[Message]) -> spark_buffer::Result<()> {
        self.inner.push_front(chat_id, messages).await
    }

    async fn publish(&self, chat_id: &str, event: &EventEnvelope) -> spark_buffer::Result<()> {
        self.inner.publish(chat_id, event).await
    }

    async fn subscribe(&self, chat_id: &str) -> spark_buffer::Result<Subscription> {
        self.inner.subscribe(chat_id).await
    }

    async fn cached_chat(&self, chat_id: &str) -> spark_buffer::Result<Option<Chat>> {
        self.inner.cached_chat(chat_id).await
    }

    async fn cache_chat(&self, chat: &Chat, ttl: Duration) -> spark_buffer::Result<()> {
        self.inner.cache_chat(chat, ttl).await
    }

    async fn invalidate_chat(&self, chat_id: &str) -> spark_buffer::Result<()> {
        self.inner.invalidate_chat(chat_id).await
    }

    async fn flush_token(&self, chat_id: &str) -> spark_buffer::Result<Option<String>> {
        self.inner.flush_token(chat_id).await
    }

    async fn set_flush_token(
        &self,
        chat_id: &str,
        token: &str,
        ttl: Duration,
    ) -> spark_buffer::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BufferError::Json(serde::de::Error::custom(
                "injected token failure",
            )));
        }
        self.inner.set_flush_token(chat_id, token, ttl).await
    }

    async fn active_chats(&self, idle_since: DateTime<Utc>) -> spark_buffer::Result<Vec<String>> {
        self.inner.active_chats(idle_since).await
    }

    async fn remove_active(&self, chat_id: &str) -> spark_buffer::Result<()> {
        self.inner.remove_active(chat_id).await
    }
}

/// Chat `c1` of match `m1` between `she` and `he`, on an in-memory
/// database, the memory buffer and a recording scheduler.
pub struct Fixture {
    pub buffer: Arc<MemoryBuffer>,
    pub repo: Arc<FlakyRepo>,
    pub scheduler: Arc<RecordingScheduler>,
    pub flush: Arc<FlushCoordinator>,
    pub services: ChatServices,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Database::open_in_memory().unwrap();
        db.insert_match("m1", "she", "he").unwrap();
        db.insert_chat("c1", "m1", Utc::now()).unwrap();

        let buffer = Arc::new(MemoryBuffer::new());
        let repo = Arc::new(FlakyRepo {
            inner: SqliteRepository::new(db),
            fail: AtomicBool::new(false),
            appends: AtomicUsize::new(0),
        });
        let scheduler = Arc::new(RecordingScheduler::default());
        let flush = Arc::new(FlushCoordinator::new(
            buffer.clone(),
            repo.clone(),
            scheduler.clone(),
            FlushSettings::default(),
        ));
        let services = ChatServices {
            buffer: buffer.clone(),
            repo: repo.clone(),
            flush: flush.clone(),
        };

        Self {
            buffer,
            repo,
            scheduler,
            flush,
            services,
        }
    }

    /// Commit everything buffered for `c1`, batch by batch.
    pub async fn flush_all(&self) {
        loop {
            let token = self
                .flush
                .schedule_flush("c1")
                .await
                .unwrap()
                .token;
            match self.flush.flush_messages("c1", &token).await.unwrap() {
                crate::flush::FlushOutcome::Flushed { remaining, .. } if remaining > 0 => {}
                _ => break,
            }
        }
    }
}
