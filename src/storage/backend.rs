//! Key-value storage backend trait
//!
//! The queue store, the conflict list and the local cache all persist through
//! this trait, so the same sync logic runs against any durable backing store
//! (SQLite on disk, an in-process map in tests).

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;

/// Storage key for the pending-mutation list
pub const PENDING_KEY: &str = "offline-pending-operations";
/// Storage key for unresolved conflict records
pub const CONFLICTS_KEY: &str = "offline-conflicts";
/// Storage key for the last successful sync timestamp
pub const LAST_SYNC_KEY: &str = "offline-last-sync";
/// Storage key for mutations that exhausted their retries
pub const DEAD_LETTERS_KEY: &str = "offline-dead-letters";
/// Storage key for the local cache snapshot
pub const CACHED_ITEMS_KEY: &str = "offline-cached-items";

/// A string-keyed, string-valued durable store
///
/// Methods take `&self`; implementations handle their own interior locking.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when the key is absent
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key; removing an absent key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// List stored keys
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-process store, used for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get(PENDING_KEY).unwrap(), None);

        store.set(PENDING_KEY, "[]").unwrap();
        assert_eq!(store.get(PENDING_KEY).unwrap().as_deref(), Some("[]"));
        assert_eq!(store.keys().unwrap(), vec![PENDING_KEY.to_string()]);

        store.remove(PENDING_KEY).unwrap();
        store.remove(PENDING_KEY).unwrap();
        assert_eq!(store.get(PENDING_KEY).unwrap(), None);
    }
}
