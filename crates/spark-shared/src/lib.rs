//! # spark-shared
//!
//! Types shared by every Spark chat crate: the chat/message domain model,
//! the field-merge policy applied to message updates, the pub/sub event
//! envelope, the WebSocket wire protocol and the fast-store key scheme.

pub mod constants;
pub mod error;
pub mod events;
pub mod keys;
pub mod models;
pub mod patch;
pub mod protocol;

pub use error::ProtocolError;
pub use events::{EventEnvelope, SeenSignal, TypingSignal};
pub use keys::KeySpace;
pub use models::*;
pub use patch::{MessagePatch, ReactionRemoval};
