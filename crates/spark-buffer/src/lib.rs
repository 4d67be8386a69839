//! # spark-buffer
//!
//! The fast shared store in front of the durable chat record: an ordered
//! write-ahead list of not-yet-committed messages per chat, the chat read
//! cache, flush tokens, last-activity tracking and the per-chat pub/sub
//! channel.
//!
//! Every mutation that other sessions can observe is a single store-side
//! transaction. Two backends implement [`BufferStore`]:
//!
//! - [`MemoryBuffer`] -- process-local, for single-node deployments and tests
//! - [`RedisBuffer`] -- Redis, with MULTI pipelines and Lua scripts

pub mod memory;
pub mod redis_store;
pub mod store;
pub mod subscription;

mod error;

pub use error::{BufferError, Result};
pub use memory::MemoryBuffer;
pub use redis_store::RedisBuffer;
pub use store::BufferStore;
pub use subscription::{Subscription, SubscriptionOptions};
