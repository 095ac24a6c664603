//! Core types for tidesync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an entity, unique within the collection
pub type EntityId = i64;

/// Per-item sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemSyncStatus {
    /// Local copy matches the remote copy
    #[default]
    Synced,
    /// Unacknowledged local mutation
    Pending,
    /// Diverged from the remote, conflict record emitted
    Conflict,
    /// Mutation exhausted its retries
    Error,
}

impl ItemSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemSyncStatus::Synced => "synced",
            ItemSyncStatus::Pending => "pending",
            ItemSyncStatus::Conflict => "conflict",
            ItemSyncStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ItemSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemSyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synced" => Ok(ItemSyncStatus::Synced),
            "pending" => Ok(ItemSyncStatus::Pending),
            "conflict" => Ok(ItemSyncStatus::Conflict),
            "error" => Ok(ItemSyncStatus::Error),
            _ => Err(format!("Unknown sync status: {}", s)),
        }
    }
}

/// The synchronized unit (a todo item)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    /// True when the local copy may differ from the remote copy
    #[serde(default)]
    pub cached: bool,
    /// Local mutation timestamp in milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default)]
    pub sync_status: ItemSyncStatus,
}

impl Entity {
    /// Create a fresh, synced entity
    pub fn new(id: EntityId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            completed: false,
            cached: false,
            last_modified: None,
            sync_status: ItemSyncStatus::Synced,
        }
    }

    /// Mark as agreeing with the remote copy
    pub fn into_synced(mut self) -> Self {
        self.cached = false;
        self.sync_status = ItemSyncStatus::Synced;
        self
    }

    /// Return a copy carrying the given status, keeping the cached flag
    pub fn with_status(mut self, status: ItemSyncStatus) -> Self {
        self.sync_status = status;
        self
    }

    /// Record a local, not yet acknowledged mutation
    pub fn touch(&mut self, now_ms: i64) {
        self.cached = true;
        self.last_modified = Some(now_ms);
        self.sync_status = ItemSyncStatus::Pending;
    }

    /// Apply the set fields of a patch
    pub fn apply_patch(&mut self, patch: &EntityPatch) {
        if let Some(ref title) = patch.title {
            self.title = title.clone();
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        if patch.last_modified.is_some() {
            self.last_modified = patch.last_modified;
        }
    }
}

/// Partial entity used as a mutation payload and as a PUT body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

impl EntityPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Default::default()
        }
    }

    /// Patch carrying every user-editable field of an entity
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            title: Some(entity.title.clone()),
            completed: Some(entity.completed),
            last_modified: entity.last_modified,
        }
    }

    pub fn with_last_modified(mut self, ts: i64) -> Self {
        self.last_modified = Some(ts);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.completed.is_none() && self.last_modified.is_none()
    }
}

/// POST body for creating an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntity {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

impl TryFrom<&EntityPatch> for NewEntity {
    type Error = crate::error::SyncError;

    fn try_from(patch: &EntityPatch) -> Result<Self, Self::Error> {
        let title = patch.title.clone().ok_or_else(|| {
            crate::error::SyncError::InvalidInput("create payload has no title".to_string())
        })?;
        Ok(Self {
            title,
            completed: patch.completed,
            last_modified: patch.last_modified,
        })
    }
}

/// Kind of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally recorded write not yet acknowledged by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub entity_id: EntityId,
    #[serde(default)]
    pub payload: EntityPatch,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

/// Sync status summary, as shown to users
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending_changes: usize,
    pub conflicts: usize,
    pub dead_letters: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_syncing: bool,
}

/// Configuration for the sync engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote API
    pub remote_url: String,
    /// Path of the synchronized collection
    #[serde(default = "default_collection_path")]
    pub collection_path: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Transport attempts for retryable failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay before the first transport retry
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Backoff multiplier between transport retries
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// Failed pushes before a mutation is dead-lettered
    #[serde(default = "default_max_mutation_retries")]
    pub max_mutation_retries: u32,
    /// Periodic sync interval while online
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

fn default_collection_path() -> String {
    "/todos".to_string()
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_max_mutation_retries() -> u32 {
    3
}

fn default_sync_interval() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: "http://localhost:3001".to_string(),
            collection_path: default_collection_path(),
            request_timeout_ms: default_request_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_multiplier: default_retry_multiplier(),
            max_mutation_retries: default_max_mutation_retries(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

impl SyncConfig {
    /// Build config from `TIDESYNC_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        let defaults = Self::default();
        Self {
            remote_url: var("TIDESYNC_REMOTE_URL").unwrap_or(defaults.remote_url),
            collection_path: var("TIDESYNC_COLLECTION_PATH").unwrap_or(defaults.collection_path),
            request_timeout_ms: var("TIDESYNC_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            retry_attempts: var("TIDESYNC_RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            retry_base_delay_ms: var("TIDESYNC_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry_base_delay_ms),
            retry_multiplier: var("TIDESYNC_RETRY_MULTIPLIER")
                .unwrap_or(defaults.retry_multiplier),
            max_mutation_retries: var("TIDESYNC_MAX_MUTATION_RETRIES")
                .unwrap_or(defaults.max_mutation_retries),
            sync_interval_secs: var("TIDESYNC_SYNC_INTERVAL_SECS")
                .unwrap_or(defaults.sync_interval_secs),
        }
    }

    /// Full URL of the collection
    pub fn collection_url(&self) -> String {
        format!(
            "{}/{}",
            self.remote_url.trim_end_matches('/'),
            self.collection_path.trim_start_matches('/')
        )
    }
}

/// Configuration for the durable store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
}

/// Storage mode for SQLite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageMode::Local),
            "cloud-safe" | "cloudsafe" => Ok(StorageMode::CloudSafe),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_wire_format() {
        let json = r#"{"id":1,"title":"buy milk","completed":false}"#;
        let entity: Entity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.id, 1);
        assert!(!entity.cached);
        assert_eq!(entity.last_modified, None);
        assert_eq!(entity.sync_status, ItemSyncStatus::Synced);

        let mut local = entity.clone();
        local.touch(1_700_000_000_000);
        let value = serde_json::to_value(&local).unwrap();
        assert_eq!(value["cached"], true);
        assert_eq!(value["lastModified"], 1_700_000_000_000i64);
        assert_eq!(value["syncStatus"], "pending");
    }

    #[test]
    fn test_mutation_wire_format() {
        let mutation = PendingMutation {
            id: "m1".to_string(),
            kind: MutationKind::Update,
            entity_id: 4,
            payload: EntityPatch::completed(true),
            timestamp: Utc::now(),
            retry_count: 0,
        };
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["entityId"], 4);
        assert_eq!(value["payload"], serde_json::json!({"completed": true}));
        assert_eq!(value["retryCount"], 0);
    }

    #[test]
    fn test_apply_patch_only_touches_set_fields() {
        let mut entity = Entity::new(1, "old");
        entity.apply_patch(&EntityPatch::completed(true));
        assert_eq!(entity.title, "old");
        assert!(entity.completed);

        entity.apply_patch(&EntityPatch::title("new").with_last_modified(5));
        assert_eq!(entity.title, "new");
        assert_eq!(entity.last_modified, Some(5));
    }

    #[test]
    fn test_new_entity_requires_title() {
        assert!(NewEntity::try_from(&EntityPatch::completed(true)).is_err());
        let created = NewEntity::try_from(&EntityPatch::title("x")).unwrap();
        assert_eq!(created.title, "x");
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Pending".parse::<ItemSyncStatus>(), Ok(ItemSyncStatus::Pending));
        assert!("bogus".parse::<ItemSyncStatus>().is_err());
        assert_eq!("cloud-safe".parse::<StorageMode>(), Ok(StorageMode::CloudSafe));
    }

    #[test]
    fn test_collection_url_joins_cleanly() {
        let config = SyncConfig {
            remote_url: "http://localhost:3001/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.collection_url(), "http://localhost:3001/todos");
    }
}
