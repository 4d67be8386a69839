//! Draining buffered messages into the durable store.
//!
//! A drain is honored only when it presents the chat's current flush token.
//! Each successful drain rotates the token, so a trigger scheduled before
//! the drain becomes a no-op when it fires.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use spark_buffer::BufferStore;
use spark_shared::constants::{
    FLUSH_BATCH_SIZE, FLUSH_IDLE_SECS, FLUSH_TOKEN_GRACE_SECS, FLUSH_TOKEN_LEN,
};
use spark_shared::generate_id;
use spark_store::ChatRepository;

use crate::error::ChatError;
use crate::scheduler::{FlushJob, FlushScheduler};

#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    pub batch_size: usize,
    pub idle_delay: Duration,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            batch_size: FLUSH_BATCH_SIZE,
            idle_delay: Duration::from_secs(FLUSH_IDLE_SECS),
        }
    }
}

impl FlushSettings {
    pub fn token_ttl(&self) -> Duration {
        self.idle_delay + Duration::from_secs(FLUSH_TOKEN_GRACE_SECS)
    }

    /// Zero once a full batch is waiting, the idle delay otherwise.
    pub fn delay_for(&self, buffered: usize) -> Duration {
        if buffered >= self.batch_size {
            Duration::ZERO
        } else {
            self.idle_delay
        }
    }
}

/// A trigger that was handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduled {
    pub token: String,
    pub delay: Duration,
    pub buffered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The presented token is not the current one; nothing changed.
    Stale,
    /// Nothing was buffered.
    Empty,
    /// `count` messages were committed, `remaining` are still buffered.
    Flushed { count: usize, remaining: usize },
}

pub struct FlushCoordinator {
    buffer: Arc<dyn BufferStore>,
    repo: Arc<dyn ChatRepository>,
    scheduler: Arc<dyn FlushScheduler>,
    settings: FlushSettings,
}

impl FlushCoordinator {
    pub fn new(
        buffer: Arc<dyn BufferStore>,
        repo: Arc<dyn ChatRepository>,
        scheduler: Arc<dyn FlushScheduler>,
        settings: FlushSettings,
    ) -> Self {
        Self {
            buffer,
            repo,
            scheduler,
            settings,
        }
    }

    pub fn settings(&self) -> FlushSettings {
        self.settings
    }

    /// Arm a drain for the chat with its current token, minting one when
    /// none is live.
    pub async fn schedule_flush(&self, chat_id: &str) -> Result<Scheduled, ChatError> {
        let buffered = self.buffer.len(chat_id).await?;

        let token = match self.buffer.flush_token(chat_id).await? {
            Some(token) if !token.is_empty() => token,
            _ => self.rotate_token(chat_id).await?,
        };

        let delay = self.settings.delay_for(buffered);
        self.trigger(chat_id, &token, delay).await?;

        Ok(Scheduled {
            token,
            delay,
            buffered,
        })
    }

    /// Commit up to one batch from the head of the chat's buffer.
    pub async fn flush_messages(
        &self,
        chat_id: &str,
        presented: &str,
    ) -> Result<FlushOutcome, ChatError> {
        if let Some(current) = self.buffer.flush_token(chat_id).await? {
            if !current.is_empty() && current != presented {
                info!(chat_id, "Stale flush token, ignoring");
                return Ok(FlushOutcome::Stale);
            }
        }

        let batch = self.buffer.pop_front(chat_id, self.settings.batch_size).await?;
        if batch.is_empty() {
            debug!(chat_id, "Nothing to flush");
            return Ok(FlushOutcome::Empty);
        }

        let count = match self.repo.append_messages(chat_id, batch.clone()).await {
            Ok(count) => count,
            Err(e) => {
                if let Err(push_err) = self.buffer.push_front(chat_id, &batch).await {
                    error!(
                        chat_id,
                        count = batch.len(),
                        error = %push_err,
                        "CRITICAL: failed to push messages back to the buffer"
                    );
                }
                return Err(ChatError::Transient(format!(
                    "failed to commit messages: {e}"
                )));
            }
        };

        if let Err(e) = self.buffer.invalidate_chat(chat_id).await {
            warn!(chat_id, error = %e, "Failed to invalidate chat cache");
        }

        // The batch is committed. Without a fresh token the live one still
        // guards the remainder, so the follow-up reuses it.
        let token = match self.rotate_token(chat_id).await {
            Ok(token) => token,
            Err(e) => {
                error!(chat_id, count, error = %e, "Failed to rotate flush token after commit");
                presented.to_string()
            }
        };

        let remaining = match self.buffer.len(chat_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to check remaining messages");
                0
            }
        };
        if remaining > 0 {
            let delay = self.settings.delay_for(remaining);
            if let Err(e) = self.trigger(chat_id, &token, delay).await {
                warn!(chat_id, error = %e, "Failed to schedule follow-up flush");
            }
        }

        info!(chat_id, count, remaining, "Flushed messages");
        Ok(FlushOutcome::Flushed { count, remaining })
    }

    async fn rotate_token(&self, chat_id: &str) -> Result<String, ChatError> {
        let token = generate_id(FLUSH_TOKEN_LEN);
        self.buffer
            .set_flush_token(chat_id, &token, self.settings.token_ttl())
            .await?;
        Ok(token)
    }

    async fn trigger(&self, chat_id: &str, token: &str, delay: Duration) -> Result<(), ChatError> {
        self.scheduler
            .schedule(FlushJob {
                chat_id: chat_id.to_string(),
                token: token.to_string(),
                delay,
            })
            .await
            .map_err(|e| ChatError::Transient(e.to_string()))
    }
}
