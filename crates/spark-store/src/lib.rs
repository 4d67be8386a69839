//! # spark-store
//!
//! Durable system of record for chats and matches, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` with typed helpers for chats and matches, and the
//! async [`ChatRepository`] seam the chat server talks to.

pub mod chats;
pub mod database;
pub mod matches;
pub mod migrations;
pub mod repository;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use matches::CounterUpdate;
pub use repository::{ChatRepository, SqliteRepository};
