//! WebSocket wire protocol between chat clients and the server.
//!
//! Client frames: `{message?, reaction?, event, mark_seen?, message_query?}`.
//! Server frames: `{message: Message[], event, error?}`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{Message, MessageType};

/// Event names shared by client commands and server notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    MessageSent,
    MessageReceived,
    MessageSeen,
    MessageUpdated,
    TypingStarted,
    TypingStopped,
    ReactionAdded,
    ReactionRemoved,
    QueryMessages,
    MessagesQuerySuccess,
    Error,
    Unauthorized,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::MessageSent => "message_sent",
            EventName::MessageReceived => "message_received",
            EventName::MessageSeen => "message_seen",
            EventName::MessageUpdated => "message_updated",
            EventName::TypingStarted => "typing_started",
            EventName::TypingStopped => "typing_stopped",
            EventName::ReactionAdded => "reaction_added",
            EventName::ReactionRemoved => "reaction_removed",
            EventName::QueryMessages => "query_messages",
            EventName::MessagesQuerySuccess => "messages_query_success",
            EventName::Error => "error",
            EventName::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "message_sent" => EventName::MessageSent,
            "message_received" => EventName::MessageReceived,
            "message_seen" => EventName::MessageSeen,
            "message_updated" => EventName::MessageUpdated,
            "typing_started" => EventName::TypingStarted,
            "typing_stopped" => EventName::TypingStopped,
            "reaction_added" => EventName::ReactionAdded,
            "reaction_removed" => EventName::ReactionRemoved,
            "query_messages" => EventName::QueryMessages,
            "messages_query_success" => EventName::MessagesQuerySuccess,
            "error" => EventName::Error,
            "unauthorized" => EventName::Unauthorized,
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        })
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// A decoded client frame. Each connection decodes into its own value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub reaction: Option<ReactionCommand>,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub mark_seen: Option<Vec<String>>,
    #[serde(default)]
    pub message_query: Option<MessageQuery>,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The command this frame asks for.
    pub fn command(&self) -> Result<EventName, ProtocolError> {
        self.event.parse()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingMessage {
    /// Target of an update or receipt; ignored on send.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<MessageType>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media: Vec<IncomingMedia>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMedia {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReactionCommand {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub reaction: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub before_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "message", default)]
    pub messages: Vec<Message>,
    pub event: EventName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerFrame {
    pub fn event(event: EventName) -> Self {
        Self {
            messages: Vec::new(),
            event,
            error: None,
        }
    }

    pub fn messages(event: EventName, messages: Vec<Message>) -> Self {
        Self {
            messages,
            event,
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            event: EventName::Error,
            error: Some(error.into()),
        }
    }

    pub fn unauthorized(error: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            event: EventName::Unauthorized,
            error: Some(error.into()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
