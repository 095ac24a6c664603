//! Offline-first synchronization
//!
//! A pass fetches the remote snapshot, reconciles it with the local one,
//! persists new conflicts and drains the pending-mutation queue.
//!
//! # Components
//!
//! - [`QueueStore`]: durable pending mutations, conflicts and dead letters
//! - [`reconcile`]: pure merge of two snapshots
//! - [`SyncOrchestrator`]: one guarded pass at a time
//! - [`SyncWorker`]: decides when passes run (startup, reconnect, interval, manual)

pub mod conflict;
mod orchestrator;
mod queue;
mod reconcile;
mod worker;

pub use conflict::{ConflictRecord, ConflictResolver, Resolution, ResolutionStrategy};
pub use orchestrator::SyncOrchestrator;
pub use queue::{CreateFollowUp, QueueStore};
pub use reconcile::{reconcile, Reconciliation};
pub use worker::{SyncCommand, SyncWorker};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Entity, EntityId, PendingMutation};

/// What started a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Startup,
    Reconnect,
    Interval,
    Manual,
}

/// Outcome of one pass; transient, never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Remote fetched and every queued mutation acknowledged
    pub success: bool,
    pub synced_operations: Vec<PendingMutation>,
    pub failed_operations: Vec<PendingMutation>,
    /// Failed mutations that reached the retry ceiling this pass
    pub dead_lettered: Vec<PendingMutation>,
    /// Conflicts newly recorded by this pass
    pub conflicts: Vec<ConflictRecord>,
    /// Reconciled snapshot; `None` when the pass aborted before reconciling
    pub merged: Option<Vec<Entity>>,
    /// Temporary ids replaced by remote-assigned ids
    #[serde(default)]
    pub remapped_ids: HashMap<EntityId, EntityId>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncResult {
    /// A pass that stopped before changing any state
    pub fn aborted(error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            synced_operations: Vec::new(),
            failed_operations: Vec::new(),
            dead_lettered: Vec::new(),
            conflicts: Vec::new(),
            merged: None,
            remapped_ids: HashMap::new(),
            error: Some(error.into()),
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Whether the pass got as far as reconciling
    pub fn reconciled(&self) -> bool {
        self.merged.is_some()
    }
}
