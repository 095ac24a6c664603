//! Conflict records and resolution strategies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Entity, EntityId, EntityPatch, ItemSyncStatus};

/// A persisted pairing of divergent local and remote states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Unique conflict identifier
    pub id: String,
    /// Entity that has the conflict
    pub entity_id: EntityId,
    /// Local snapshot at detection time
    pub local: Entity,
    /// Remote snapshot at detection time
    pub remote: Entity,
    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn new(local: Entity, remote: Entity, detected_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: local.id,
            local,
            remote,
            detected_at,
        }
    }

    /// Same divergence as another record, ignoring identity and detection time
    pub fn same_divergence(&self, other: &ConflictRecord) -> bool {
        self.entity_id == other.entity_id
            && self.local == other.local
            && self.remote == other.remote
    }
}

/// Resolution strategy for conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Keep local version and push it
    KeepLocal,
    /// Adopt remote version
    KeepRemote,
    /// Take the version with the later `lastModified`
    TakeNewer,
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "keep-local" | "local" => Ok(ResolutionStrategy::KeepLocal),
            "keep-remote" | "remote" => Ok(ResolutionStrategy::KeepRemote),
            "take-newer" | "newer" => Ok(ResolutionStrategy::TakeNewer),
            _ => Err(format!("Unknown resolution strategy: {}", s)),
        }
    }
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub conflict_id: String,
    /// Strategy actually applied; `TakeNewer` resolves to one of the other two
    pub applied: ResolutionStrategy,
    /// Entity to put in the local cache
    pub entity: Entity,
    /// Update to queue for the remote, if the local side won
    pub push: Option<EntityPatch>,
}

/// Turns conflict records into cache updates
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a conflict; `now_ms` stamps a re-pushed local version
    pub fn resolve(
        &self,
        conflict: &ConflictRecord,
        strategy: ResolutionStrategy,
        now_ms: i64,
    ) -> Resolution {
        let applied = match strategy {
            ResolutionStrategy::TakeNewer => {
                if conflict.local.last_modified > conflict.remote.last_modified {
                    ResolutionStrategy::KeepLocal
                } else {
                    ResolutionStrategy::KeepRemote
                }
            }
            other => other,
        };

        match applied {
            ResolutionStrategy::KeepLocal => {
                let mut entity = conflict.local.clone();
                entity.touch(now_ms);
                Resolution {
                    conflict_id: conflict.id.clone(),
                    applied,
                    push: Some(EntityPatch::from_entity(&entity)),
                    entity,
                }
            }
            _ => Resolution {
                conflict_id: conflict.id.clone(),
                applied: ResolutionStrategy::KeepRemote,
                entity: conflict.remote.clone().into_synced(),
                push: None,
            },
        }
    }
}

/// True if the entity is waiting on a conflict resolution
pub fn is_conflicted(entity: &Entity) -> bool {
    entity.sync_status == ItemSyncStatus::Conflict
}
