//! Tidesync - offline-first sync engine
//!
//! Keeps a locally mutated collection in step with a remote REST collection:
//! a durable queue of pending mutations, timestamp-ordered reconciliation
//! with explicit conflict records, and bounded retries with a dead-letter list.

pub mod cache;
pub mod clock;
pub mod error;
pub mod network;
pub mod remote;
pub mod server;
pub mod storage;
pub mod sync;
pub mod types;

pub use cache::LocalCache;
pub use error::{Result, SyncError};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
