//! # parley-store
//!
//! Durable storage for rooms, room participants, users and signed chat
//! messages.
//!
//! The server talks to storage only through the [`Storage`] trait. Two
//! implementations ship here: [`SqliteStorage`], which wraps the synchronous
//! [`Database`] handle around a `rusqlite::Connection`, and
//! [`MemoryStorage`] for tests and throwaway deployments.

pub mod database;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;
pub mod storage;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryStorage;
pub use models::*;
pub use storage::{SqliteStorage, Storage};
