//! Chat session: one participant's view of one chat.
//!
//! A session binds `(chat_id, user_id)` to the shared buffer and durable
//! store after checking the user belongs to the chat's match. Reads merge
//! the durable record with the buffer, durable first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use spark_buffer::{BufferStore, Subscription};
use spark_shared::constants::{CHAT_CACHE_TTL_SECS, MESSAGE_ID_LEN, UNLOCK_THRESHOLD};
use spark_shared::{
    generate_id, Chat, EventEnvelope, Message, MessagePatch, Participants, SeenSignal,
};
use spark_store::{ChatRepository, CounterUpdate};

use crate::error::ChatError;
use crate::flush::FlushCoordinator;

/// Collaborators shared by every session in the process.
#[derive(Clone)]
pub struct ChatServices {
    pub buffer: Arc<dyn BufferStore>,
    pub repo: Arc<dyn ChatRepository>,
    pub flush: Arc<FlushCoordinator>,
}

pub struct ChatSession {
    chat_id: String,
    user_id: String,
    match_id: String,
    participants: Participants,
    services: ChatServices,
}

impl ChatSession {
    /// Open a session, rejecting users outside the chat's match.
    pub async fn open(
        services: ChatServices,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let chat_id = chat_id.into();
        let user_id = user_id.into();

        let chat = load_chat(&services, &chat_id).await?;
        let owner = services.repo.load_match(&chat.match_id).await?;
        let participants = owner.participants();
        if !participants.contains(&user_id) {
            warn!(chat_id = %chat_id, user_id = %user_id, "Rejected non-participant");
            return Err(ChatError::Unauthorized);
        }

        debug!(chat_id = %chat_id, user_id = %user_id, "Chat session opened");
        Ok(Self {
            chat_id,
            user_id,
            match_id: chat.match_id,
            participants,
            services,
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    pub async fn subscribe(&self) -> Result<Subscription, ChatError> {
        Ok(self.services.buffer.subscribe(&self.chat_id).await?)
    }

    /// Buffer a message from this session's user and fan it out.
    ///
    /// The id is assigned when absent and `updated_at` always starts equal
    /// to `created_at`.
    pub async fn send_message(&self, mut msg: Message) -> Result<Message, ChatError> {
        if msg.id.is_empty() {
            msg.id = generate_id(MESSAGE_ID_LEN);
        }
        msg.sender_id = self.user_id.clone();
        msg.updated_at = msg.created_at;

        let event = EventEnvelope::Message {
            message: msg.clone(),
        };
        self.services
            .buffer
            .append(&self.chat_id, &msg, &event, Utc::now())
            .await?;

        self.spawn_counter_update();

        // The message is already buffered and published. A lost trigger is
        // recovered by the active-chat sweep.
        if let Err(e) = self.services.flush.schedule_flush(&self.chat_id).await {
            warn!(chat_id = %self.chat_id, error = %e, "Failed to schedule flush");
        }

        Ok(msg)
    }

    fn spawn_counter_update(&self) {
        let repo = self.services.repo.clone();
        let match_id = self.match_id.clone();
        let sender_id = self.user_id.clone();
        tokio::spawn(async move {
            match repo
                .record_message_sent(&match_id, &sender_id, UNLOCK_THRESHOLD)
                .await
            {
                Ok(CounterUpdate::Unlocked) => {
                    info!(match_id = %match_id, "Match unlocked");
                }
                Ok(CounterUpdate::NotParticipant) => {
                    warn!(match_id = %match_id, user_id = %sender_id, "Counter update for non-participant");
                }
                Ok(update) => debug!(match_id = %match_id, ?update, "Message counted"),
                Err(e) => {
                    warn!(match_id = %match_id, error = %e, "Failed to update message counters");
                }
            }
        });
    }

    /// Committed then buffered messages, optionally strictly before
    /// `before_id`, keeping at most `limit` from the end. `limit == 0`
    /// keeps all.
    pub async fn get_messages(
        &self,
        limit: usize,
        before_id: Option<&str>,
    ) -> Result<Vec<Message>, ChatError> {
        let chat = self.get_chat().await?;
        let buffered = self.services.buffer.buffered(&self.chat_id).await?;

        let mut all = chat.messages;
        all.extend(buffered);

        if let Some(cursor) = before_id.filter(|c| !c.is_empty()) {
            if let Some(pos) = all.iter().position(|m| m.id == cursor) {
                all.truncate(pos);
            }
        }

        if limit > 0 && all.len() > limit {
            all.drain(..all.len() - limit);
        }
        Ok(all)
    }

    /// Look a message up in the buffer, then in the durable record.
    pub async fn get_message_by_id(&self, message_id: &str) -> Result<Message, ChatError> {
        let buffered = self.services.buffer.buffered(&self.chat_id).await?;
        if let Some(found) = buffered.into_iter().find(|m| m.id == message_id) {
            return Ok(found);
        }

        self.get_chat()
            .await?
            .messages
            .into_iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
    }

    /// Merge `patch` into a message wherever it lives and publish the result.
    pub async fn update_message(
        &self,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<Message, ChatError> {
        let (message, content_changed) = self.merge(message_id, patch).await?;

        self.services
            .buffer
            .publish(
                &self.chat_id,
                &EventEnvelope::Update {
                    message: message.clone(),
                    actor_id: self.user_id.clone(),
                    content_changed,
                },
            )
            .await?;
        Ok(message)
    }

    /// Buffer first, durable record second.
    async fn merge(
        &self,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<(Message, bool), ChatError> {
        let buffered = self
            .services
            .buffer
            .update_buffered(&self.chat_id, message_id, &patch, Utc::now())
            .await?;
        if let Some(hit) = buffered {
            return Ok(hit);
        }

        let merged = self
            .services
            .repo
            .update_message(&self.chat_id, message_id, patch)
            .await?;
        self.invalidate_cache().await;
        Ok(merged)
    }

    pub async fn send_typing_event(&self) -> Result<(), ChatError> {
        self.publish_typing(true).await
    }

    pub async fn stop_typing_event(&self) -> Result<(), ChatError> {
        self.publish_typing(false).await
    }

    async fn publish_typing(&self, is_typing: bool) -> Result<(), ChatError> {
        let event = EventEnvelope::typing(self.user_id.clone(), is_typing);
        self.services.buffer.publish(&self.chat_id, &event).await?;
        Ok(())
    }

    /// Mark messages seen and received on behalf of `user_id`, then publish
    /// one `seen` signal. Individual ids that cannot be updated are skipped.
    pub async fn mark_messages_seen(
        &self,
        message_ids: &[String],
        user_id: &str,
    ) -> Result<(), ChatError> {
        for id in message_ids {
            if let Err(e) = self.merge(id, MessagePatch::seen()).await {
                debug!(chat_id = %self.chat_id, message_id = %id, error = %e, "Skipping seen update");
            }
        }

        let event = EventEnvelope::Seen(SeenSignal {
            message_ids: message_ids.to_vec(),
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
        });
        self.services.buffer.publish(&self.chat_id, &event).await?;
        Ok(())
    }

    /// The committed chat, cache first.
    pub async fn get_chat(&self) -> Result<Chat, ChatError> {
        load_chat(&self.services, &self.chat_id).await
    }

    async fn invalidate_cache(&self) {
        if let Err(e) = self.services.buffer.invalidate_chat(&self.chat_id).await {
            warn!(chat_id = %self.chat_id, error = %e, "Failed to invalidate chat cache");
        }
    }
}

async fn load_chat(services: &ChatServices, chat_id: &str) -> Result<Chat, ChatError> {
    match services.buffer.cached_chat(chat_id).await {
        Ok(Some(chat)) => return Ok(chat),
        Ok(None) => {}
        Err(e) => warn!(chat_id, error = %e, "Chat cache read failed"),
    }

    let chat = services.repo.load_chat(chat_id).await?;
    if let Err(e) = services
        .buffer
        .cache_chat(&chat, Duration::from_secs(CHAT_CACHE_TTL_SECS))
        .await
    {
        warn!(chat_id, error = %e, "Chat cache write failed");
    }
    Ok(chat)
}
