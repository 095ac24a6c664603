//! One guarded sync pass: fetch, reconcile, persist conflicts, drain the queue

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::queue::{CreateFollowUp, QueueStore};
use super::reconcile::reconcile;
use super::SyncResult;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::remote::RemoteClient;
use crate::types::{
    Entity, EntityId, ItemSyncStatus, MutationKind, NewEntity, PendingMutation, SyncStatus,
};

/// Default failed pushes before a mutation is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Clears the in-flight flag however the pass ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sequences sync passes, at most one at a time
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteClient>,
    queue: Arc<QueueStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    in_flight: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl SyncOrchestrator {
    pub fn new(remote: Arc<dyn RemoteClient>, queue: Arc<QueueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            remote,
            queue,
            clock,
            max_retries: DEFAULT_MAX_RETRIES,
            in_flight: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Failed pushes tolerated before a mutation is dead-lettered
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            pending_changes: self.queue.list_pending().len(),
            conflicts: self.queue.list_conflicts().len(),
            dead_letters: self.queue.list_dead_letters().len(),
            last_sync: self.queue.last_sync(),
            last_error: self.last_error.lock().clone(),
            is_syncing: self.is_syncing(),
        }
    }

    /// Whether the remote answers at all
    pub async fn probe_remote(&self) -> bool {
        match self.remote.ping().await {
            Ok(reachable) => reachable,
            Err(e) => {
                tracing::debug!("Remote probe failed: {}", e);
                false
            }
        }
    }

    /// Run one pass against the given local snapshot
    ///
    /// Refuses to start while another pass is in flight. A failed remote
    /// fetch aborts the pass before any state changes.
    pub async fn run_sync(&self, local: &[Entity]) -> SyncResult {
        let started_at = self.clock.now();

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync requested while a pass is running, skipping");
            return self.aborted(SyncError::SyncInProgress, started_at);
        }
        let _in_flight = InFlight(&self.in_flight);

        let result = self.pass(local, started_at).await;
        *self.last_error.lock() = result.error.clone();
        result
    }

    fn aborted(&self, error: SyncError, started_at: DateTime<Utc>) -> SyncResult {
        let mut result = SyncResult::aborted(error.to_string(), started_at);
        result.completed_at = self.clock.now();
        result
    }

    async fn pass(&self, local: &[Entity], started_at: DateTime<Utc>) -> SyncResult {
        tracing::info!("Starting sync pass ({} local items)", local.len());

        let remote = match self.remote.fetch_all().await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Sync aborted, remote fetch failed: {}", e);
                return self.aborted(e, started_at);
            }
        };

        let reconciliation = reconcile(local, &remote, self.clock.now());
        let conflicts = match self.queue.append_conflicts(&reconciliation.conflicts) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("Sync aborted, could not persist conflicts: {}", e);
                return self.aborted(e, started_at);
            }
        };
        let mut merged = reconciliation.merged;

        // ====================================================================
        // Drain the queue, strictly one mutation at a time
        // ====================================================================

        let mut synced = Vec::new();
        let mut failed = Vec::new();
        let mut dead_lettered = Vec::new();
        let mut remapped: HashMap<EntityId, EntityId> = HashMap::new();

        let mut work: VecDeque<PendingMutation> = self.queue.list_pending().into();
        while let Some(mut mutation) = work.pop_front() {
            if let Some(&new_id) = remapped.get(&mutation.entity_id) {
                mutation.entity_id = new_id;
            }

            match self.push(&mutation).await {
                Ok(acknowledged) => {
                    if let Some(follow_up) = self.settle(&mutation, acknowledged.as_ref()) {
                        work.push_front(follow_up);
                    }
                    self.apply_ack(&mutation, acknowledged, &mut merged, &mut remapped);
                    synced.push(mutation);
                }
                Err(e) => {
                    tracing::warn!(
                        "Push of {} for entity {} failed: {}",
                        mutation.kind,
                        mutation.entity_id,
                        e
                    );
                    let failed_mutation = match self.queue.record_failure(&mutation.id) {
                        Ok(Some(updated)) => updated,
                        Ok(None) => mutation,
                        Err(e) => {
                            tracing::warn!("Failed to record push failure: {}", e);
                            mutation
                        }
                    };

                    if failed_mutation.retry_count >= self.max_retries {
                        match self.queue.dead_letter(std::slice::from_ref(&failed_mutation)) {
                            Ok(()) => dead_lettered.push(failed_mutation.clone()),
                            Err(e) => tracing::warn!("Failed to dead-letter mutation: {}", e),
                        }
                    }
                    failed.push(failed_mutation);
                }
            }
        }

        // Entities with a delete still queued stay hidden
        let hidden: HashSet<EntityId> = self
            .queue
            .list_pending()
            .into_iter()
            .filter(|m| m.kind == MutationKind::Delete)
            .map(|m| m.entity_id)
            .collect();
        merged.retain(|e| !hidden.contains(&e.id));

        for mutation in &dead_lettered {
            if let Some(entity) = merged.iter_mut().find(|e| e.id == mutation.entity_id) {
                entity.sync_status = ItemSyncStatus::Error;
            }
        }

        let completed_at = self.clock.now();
        if let Err(e) = self.queue.set_last_sync(completed_at) {
            tracing::warn!("Failed to record last sync time: {}", e);
        }

        let error = if failed.is_empty() {
            None
        } else {
            Some(format!("{} of {} operations failed", failed.len(), failed.len() + synced.len()))
        };

        tracing::info!(
            "Sync pass finished: {} synced, {} failed, {} dead-lettered, {} new conflicts",
            synced.len(),
            failed.len(),
            dead_lettered.len(),
            conflicts.len()
        );

        SyncResult {
            success: failed.is_empty(),
            synced_operations: synced,
            failed_operations: failed,
            dead_lettered,
            conflicts,
            merged: Some(merged),
            remapped_ids: remapped,
            error,
            started_at,
            completed_at,
        }
    }

    /// Send one mutation; returns the server's copy when it answers with one
    async fn push(&self, mutation: &PendingMutation) -> Result<Option<Entity>> {
        match mutation.kind {
            MutationKind::Create => {
                let input = NewEntity::try_from(&mutation.payload)?;
                self.remote.create(&input).await.map(Some)
            }
            MutationKind::Update => self
                .remote
                .update(mutation.entity_id, &mutation.payload)
                .await
                .map(Some),
            MutationKind::Delete => match self.remote.delete(mutation.entity_id).await {
                Ok(_) => Ok(None),
                Err(SyncError::NotFound(_)) => {
                    tracing::debug!("Entity {} already gone remotely", mutation.entity_id);
                    Ok(None)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Take an acknowledged mutation off the queue
    ///
    /// Returns the mutation to push next when the entity of an acknowledged
    /// create was edited or deleted while the create was in flight.
    fn settle(
        &self,
        mutation: &PendingMutation,
        acknowledged: Option<&Entity>,
    ) -> Option<PendingMutation> {
        let created_id = match (mutation.kind, acknowledged) {
            (MutationKind::Create, Some(server)) => server.id,
            _ => {
                if let Err(e) = self.queue.dequeue_completed(&[mutation.id.clone()]) {
                    tracing::warn!("Failed to dequeue mutation {}: {}", mutation.id, e);
                }
                return None;
            }
        };

        match self
            .queue
            .acknowledge_create(&mutation.id, mutation.entity_id, created_id)
        {
            Ok(CreateFollowUp::Settled) => None,
            Ok(CreateFollowUp::Update(update)) => {
                tracing::debug!("Entity {} edited during its create, updating", created_id);
                Some(update)
            }
            Ok(CreateFollowUp::Delete(delete)) => {
                tracing::debug!("Entity {} deleted during its create, deleting", created_id);
                Some(delete)
            }
            Err(e) => {
                tracing::warn!("Failed to settle create {}: {}", mutation.id, e);
                None
            }
        }
    }

    fn apply_ack(
        &self,
        mutation: &PendingMutation,
        acknowledged: Option<Entity>,
        merged: &mut Vec<Entity>,
        remapped: &mut HashMap<EntityId, EntityId>,
    ) {
        let Some(server) = acknowledged else {
            merged.retain(|e| e.id != mutation.entity_id);
            return;
        };

        if mutation.kind == MutationKind::Create && server.id != mutation.entity_id {
            tracing::debug!("Entity {} assigned id {}", mutation.entity_id, server.id);
            remapped.insert(mutation.entity_id, server.id);
            merged.retain(|e| e.id != server.id);
        }

        let server = server.into_synced();
        match merged.iter_mut().find(|e| e.id == mutation.entity_id) {
            Some(entity) => *entity = server,
            None => merged.push(server),
        }
    }
}
