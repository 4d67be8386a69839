//! Partial message updates.
//!
//! The same merge policy runs in three places: [`MessagePatch::apply`] for
//! durable rows and the memory buffer, and the Lua script of the Redis
//! buffer. Both must agree:
//!
//! * `content` overwrites only when non-empty and different, and only that
//!   case bumps `updated_at`.
//! * `type`, `received`, `seen`, `media` and `reactions` overwrite whenever
//!   present.
//! * `remove_reactions` then drops one sender's reactions (all of them, or
//!   only those with the given content), and `add_reaction` appends one.
//!   Both act on the stored list inside the same merge, so two reactions
//!   arriving together are both kept.
//! * `id`, `created_at` and `updated_at` cannot be expressed in a patch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Media, Message, MessageType, Reaction};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<Media>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<Reaction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_reactions: Option<ReactionRemoval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_reaction: Option<Reaction>,
}

/// Reactions to drop: every reaction by `sender_id`, or only those whose
/// content matches when `content` is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRemoval {
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
}

impl ReactionRemoval {
    fn matches(&self, reaction: &Reaction) -> bool {
        reaction.sender_id == self.sender_id
            && (self.content.is_empty() || reaction.content == self.content)
    }
}

impl MessagePatch {
    /// Patch applied by `mark_messages_seen`.
    pub fn seen() -> Self {
        Self {
            seen: Some(true),
            received: Some(true),
            ..Self::default()
        }
    }

    pub fn received() -> Self {
        Self {
            received: Some(true),
            ..Self::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn reactions(reactions: Vec<Reaction>) -> Self {
        Self {
            reactions: Some(reactions),
            ..Self::default()
        }
    }

    pub fn add_reaction(reaction: Reaction) -> Self {
        Self {
            add_reaction: Some(reaction),
            ..Self::default()
        }
    }

    pub fn remove_reactions(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            remove_reactions: Some(ReactionRemoval {
                sender_id: sender_id.into(),
                content: content.into(),
            }),
            ..Self::default()
        }
    }

    /// Merge into `msg`. Returns whether the content changed.
    pub fn apply(&self, msg: &mut Message, now: DateTime<Utc>) -> bool {
        let mut content_changed = false;
        if let Some(content) = &self.content {
            if !content.is_empty() && *content != msg.content {
                msg.content = content.clone();
                content_changed = true;
            }
        }
        if let Some(kind) = self.kind {
            msg.kind = kind;
        }
        if let Some(received) = self.received {
            msg.received = received;
        }
        if let Some(seen) = self.seen {
            msg.seen = seen;
        }
        if let Some(media) = &self.media {
            msg.media = media.clone();
        }
        if let Some(reactions) = &self.reactions {
            msg.reactions = reactions.clone();
        }
        if let Some(removal) = &self.remove_reactions {
            msg.reactions.retain(|r| !removal.matches(r));
        }
        if let Some(reaction) = &self.add_reaction {
            msg.reactions.push(reaction.clone());
        }
        if content_changed {
            msg.updated_at = now;
        }
        content_changed
    }
}
