//! Domain model shared by the buffer, the durable store and the wire
//! protocol.
//!
//! Every struct derives `Serialize` and `Deserialize`; the JSON form is the
//! one stored in buffer entries, in the durable `messages` column and sent to
//! clients, so field names are part of the external contract.

use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Generate an uppercase alphanumeric identifier of `len` characters.
pub fn generate_id(len: usize) -> String {
    Alphanumeric
        .sample_string(&mut rand::thread_rng(), len)
        .to_uppercase()
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Kind of content a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

/// A media attachment on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// A reaction left on a message by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A single chat message.
///
/// `updated_at` moves only when `content` changes; the `received` and
/// `seen` flags are receipts and leave it untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier, unique within the chat.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub received: bool,
    #[serde(default)]
    pub seen: bool,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub media: Vec<Media>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// A text message stamped with the current time and no identifier.
    pub fn text(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            kind: MessageType::Text,
            content: content.into(),
            sender_id: sender_id.into(),
            received: false,
            seen: false,
            media: Vec::new(),
            reactions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Accept `null`, an empty JSON object or an array for list fields.
///
/// Lua's cjson encodes an empty array as `{}` after an in-place buffer
/// update, and older rows may hold `null`.
fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient<T> {
        Seq(Vec<T>),
        Map(serde_json::Map<String, serde_json::Value>),
    }

    match Option::<Lenient<T>>::deserialize(deserializer)? {
        Some(Lenient::Seq(items)) => Ok(items),
        Some(Lenient::Map(map)) if map.is_empty() => Ok(Vec::new()),
        Some(Lenient::Map(_)) => Err(serde::de::Error::custom(
            "expected an array or an empty object",
        )),
        None => Ok(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A conversation between the two participants of a match, holding the
/// durably committed messages in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub match_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub messages: Vec<Message>,
}

// ---------------------------------------------------------------------------
// Match
// ---------------------------------------------------------------------------

/// The owning match record of a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub she_id: String,
    pub he_id: String,
    pub she_messages: i64,
    pub he_messages: i64,
    pub is_unlocked: bool,
}

impl Match {
    pub fn participants(&self) -> Participants {
        Participants {
            she_id: self.she_id.clone(),
            he_id: self.he_id.clone(),
        }
    }
}

/// The two users authorized to read and write a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants {
    pub she_id: String,
    pub he_id: String,
}

impl Participants {
    pub fn contains(&self, user_id: &str) -> bool {
        self.she_id == user_id || self.he_id == user_id
    }

    /// The participant that is not `user_id`, if `user_id` is one of them.
    pub fn other(&self, user_id: &str) -> Option<&str> {
        if self.she_id == user_id {
            Some(&self.he_id)
        } else if self.he_id == user_id {
            Some(&self.she_id)
        } else {
            None
        }
    }
}
