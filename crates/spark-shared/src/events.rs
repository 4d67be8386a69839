//! Events broadcast on a chat's pub/sub channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Tagged notification delivered to every subscriber of a chat.
///
/// Serialized as `{"type": "<tag>", ...payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventEnvelope {
    /// A newly buffered message.
    Message { message: Message },
    /// A message after a merge, with the user who performed it.
    Update {
        message: Message,
        actor_id: String,
        content_changed: bool,
    },
    Seen(SeenSignal),
    Typing(TypingSignal),
}

impl EventEnvelope {
    /// The user whose action produced this event.
    pub fn author(&self) -> &str {
        match self {
            EventEnvelope::Message { message } => &message.sender_id,
            EventEnvelope::Update { actor_id, .. } => actor_id,
            EventEnvelope::Seen(seen) => &seen.user_id,
            EventEnvelope::Typing(typing) => &typing.user_id,
        }
    }

    pub fn typing(user_id: impl Into<String>, is_typing: bool) -> Self {
        EventEnvelope::Typing(TypingSignal {
            user_id: user_id.into(),
            is_typing,
            timestamp: Utc::now(),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// A batch of messages marked seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenSignal {
    pub message_ids: Vec<String>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub user_id: String,
    pub is_typing: bool,
    pub timestamp: DateTime<Utc>,
}
