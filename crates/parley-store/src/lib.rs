//! # parley-store
//!
//! SQLite-backed document store for conversations, messages, seen receipts
//! and user profiles.  The crate exposes a synchronous `Database` handle that
//! wraps a `rusqlite::Connection` and provides typed CRUD helpers for every
//! domain model.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use parley_shared::models::*;
