//! Durable key-value storage for tidesync
//!
//! Handles the SQLite backing store, WAL mode, and schema management.

mod backend;
mod connection;
mod migrations;

pub use backend::{
    KeyValueStore, MemoryStore, CACHED_ITEMS_KEY, CONFLICTS_KEY, DEAD_LETTERS_KEY, LAST_SYNC_KEY,
    PENDING_KEY,
};
pub use connection::SqliteStore;
pub use migrations::SCHEMA_VERSION;
