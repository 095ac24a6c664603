//! Local cache of the entity collection
//!
//! The cache owns the possibly-offline-mutated view of the collection and
//! persists it under `offline-cached-items`. Writes go straight to the remote
//! when online and the entity is in step with it; otherwise they are applied
//! locally, stamped, and queued for the next sync pass.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::network::Connectivity;
use crate::remote::RemoteClient;
use crate::storage::{KeyValueStore, CACHED_ITEMS_KEY};
use crate::sync::conflict::is_conflicted;
use crate::sync::{ConflictResolver, QueueStore, Resolution, ResolutionStrategy, SyncResult};
use crate::types::{Entity, EntityId, EntityPatch, ItemSyncStatus, MutationKind, NewEntity};

/// In-memory entity collection backed by a durable copy
pub struct LocalCache {
    items: RwLock<Vec<Entity>>,
    /// Entities touched since the current pass took its snapshot
    dirty: Mutex<HashSet<EntityId>>,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<QueueStore>,
    remote: Arc<dyn RemoteClient>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    resolver: ConflictResolver,
}

impl LocalCache {
    /// Create a cache seeded from the persisted copy, if any
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queue: Arc<QueueStore>,
        remote: Arc<dyn RemoteClient>,
        connectivity: Connectivity,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let items = read_persisted(store.as_ref());
        Self {
            items: RwLock::new(items),
            dirty: Mutex::new(HashSet::new()),
            store,
            queue,
            remote,
            connectivity,
            clock,
            resolver: ConflictResolver::new(),
        }
    }

    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn snapshot(&self) -> Vec<Entity> {
        self.items.read().clone()
    }

    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.items.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Entities waiting on a conflict resolution
    pub fn conflicted(&self) -> Vec<Entity> {
        self.items
            .read()
            .iter()
            .filter(|e| is_conflicted(e))
            .cloned()
            .collect()
    }

    /// Initial load from the remote
    ///
    /// Adopts the remote snapshot unless the persisted copy carries local
    /// changes, which are left for the next sync pass to reconcile. When the
    /// remote cannot be reached the persisted copy is kept.
    pub async fn load(&self) -> Result<Vec<Entity>> {
        if !self.connectivity.is_online() {
            tracing::info!("Offline, using {} cached items", self.len());
            return Ok(self.snapshot());
        }

        match self.remote.fetch_all().await {
            Ok(remote) => {
                let has_local_changes = self.items.read().iter().any(|e| e.cached);
                if has_local_changes {
                    tracing::info!("Cache holds local changes, deferring to sync");
                } else {
                    *self.items.write() = remote.into_iter().map(Entity::into_synced).collect();
                    self.persist()?;
                }
            }
            Err(e) => {
                tracing::warn!("Initial load failed, using cached items: {}", e);
            }
        }
        Ok(self.snapshot())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn create(&self, title: &str) -> Result<Entity> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::InvalidInput("title must not be empty".to_string()));
        }

        if self.connectivity.is_online() {
            let input = NewEntity {
                title: title.to_string(),
                completed: None,
                last_modified: None,
            };
            match self.remote.create(&input).await {
                Ok(created) => {
                    let created = created.into_synced();
                    self.items.write().push(created.clone());
                    self.persist()?;
                    return Ok(created);
                }
                Err(e) if e.is_retryable() => {
                    tracing::info!("Create failed, queueing for later: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        let now = self.clock.now_millis();
        let mut entity = Entity::new(self.temporary_id(now), title);
        entity.touch(now);

        self.queue.enqueue(
            MutationKind::Create,
            entity.id,
            EntityPatch::from_entity(&entity),
        )?;
        self.items.write().push(entity.clone());
        self.mark_dirty(entity.id);
        self.persist()?;
        Ok(entity)
    }

    pub async fn update(&self, id: EntityId, patch: EntityPatch) -> Result<Entity> {
        let current = self.get(id).ok_or(SyncError::NotFound(id))?;
        if patch.is_empty() {
            return Ok(current);
        }

        // Unpushed create: fold the edit into it
        if self.queue.find_pending(id, MutationKind::Create).is_some() {
            let mut entity = current;
            entity.apply_patch(&patch);
            entity.touch(self.clock.now_millis());
            self.queue.enqueue(
                MutationKind::Create,
                id,
                EntityPatch::from_entity(&entity),
            )?;
            return self.store_local(entity);
        }

        if self.writes_through(&current) {
            match self.remote.update(id, &patch).await {
                Ok(updated) => return self.store_local(updated.into_synced()),
                Err(e) if e.is_retryable() => {
                    tracing::info!("Update of {} failed, queueing for later: {}", id, e);
                }
                Err(e) => return Err(e),
            }
        }

        let mut entity = current;
        let was_conflicted = entity.sync_status == ItemSyncStatus::Conflict;
        entity.apply_patch(&patch);
        entity.touch(self.clock.now_millis());
        if was_conflicted {
            entity.sync_status = ItemSyncStatus::Conflict;
        }
        self.queue.enqueue(
            MutationKind::Update,
            id,
            EntityPatch::from_entity(&entity),
        )?;
        self.store_local(entity)
    }

    /// Flip the completion flag
    pub async fn toggle(&self, id: EntityId) -> Result<Entity> {
        let current = self.get(id).ok_or(SyncError::NotFound(id))?;
        self.update(id, EntityPatch::completed(!current.completed))
            .await
    }

    pub async fn delete(&self, id: EntityId) -> Result<()> {
        let current = self.get(id).ok_or(SyncError::NotFound(id))?;

        if self.queue.find_pending(id, MutationKind::Create).is_some() {
            let dropped = self.queue.discard_for_entity(id)?;
            tracing::debug!("Dropped {} unpushed mutations for {}", dropped.len(), id);
            return self.remove_local(id);
        }

        if self.writes_through(&current) {
            match self.remote.delete(id).await {
                Ok(_) | Err(SyncError::NotFound(_)) => return self.remove_local(id),
                Err(e) if e.is_retryable() => {
                    tracing::info!("Delete of {} failed, queueing for later: {}", id, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.queue.discard_for_entity(id)?;
        self.queue
            .enqueue(MutationKind::Delete, id, EntityPatch::default())?;
        self.remove_local(id)
    }

    /// Settle a recorded conflict and drop its record
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution> {
        let record = self
            .queue
            .list_conflicts()
            .into_iter()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| SyncError::InvalidInput(format!("Unknown conflict: {}", conflict_id)))?;

        let resolution = self
            .resolver
            .resolve(&record, strategy, self.clock.now_millis());

        match resolution.push {
            Some(ref patch) => {
                self.queue
                    .enqueue(MutationKind::Update, record.entity_id, patch.clone())?;
            }
            None => {
                self.queue.discard_for_entity(record.entity_id)?;
            }
        }

        {
            let mut items = self.items.write();
            match items.iter_mut().find(|e| e.id == record.entity_id) {
                Some(entity) => *entity = resolution.entity.clone(),
                None => items.push(resolution.entity.clone()),
            }
        }
        self.mark_dirty(record.entity_id);
        self.queue.remove_conflict(conflict_id)?;
        self.persist()?;

        tracing::info!(
            "Resolved conflict on entity {} with {:?}",
            record.entity_id,
            resolution.applied
        );
        Ok(resolution)
    }

    // ========================================================================
    // Sync integration
    // ========================================================================

    /// Snapshot for a pass; edits from here on are re-applied over its result
    pub fn begin_sync(&self) -> Vec<Entity> {
        self.dirty.lock().clear();
        self.snapshot()
    }

    /// Replace the collection with a pass's merged snapshot
    ///
    /// Entities edited while the pass was in flight keep their local state.
    /// Aborted passes leave the cache untouched.
    pub fn apply_sync_result(&self, result: &SyncResult) -> Result<()> {
        let Some(ref merged) = result.merged else {
            return Ok(());
        };

        let dirty: Vec<EntityId> = self.dirty.lock().drain().collect();
        for (&old_id, &new_id) in &result.remapped_ids {
            // Mutations queued during the pass still carry the temporary id
            self.queue.retarget(old_id, new_id)?;
        }

        {
            let mut items = self.items.write();
            let mut next = merged.clone();

            for id in dirty {
                let target = result.remapped_ids.get(&id).copied().unwrap_or(id);
                let local = items.iter().find(|e| e.id == id).cloned();
                next.retain(|e| e.id != target);
                if let Some(mut entity) = local {
                    entity.id = target;
                    next.push(entity);
                }
            }

            *items = next;
        }

        self.persist()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Online, and no local changes the remote hasn't seen
    fn writes_through(&self, entity: &Entity) -> bool {
        self.connectivity.is_online()
            && !entity.cached
            && entity.sync_status == ItemSyncStatus::Synced
    }

    /// Millisecond timestamp, bumped past any id already in use
    fn temporary_id(&self, now_ms: i64) -> EntityId {
        let items = self.items.read();
        let mut id = now_ms;
        while items.iter().any(|e| e.id == id) {
            id += 1;
        }
        id
    }

    fn mark_dirty(&self, id: EntityId) {
        self.dirty.lock().insert(id);
    }

    fn store_local(&self, entity: Entity) -> Result<Entity> {
        {
            let mut items = self.items.write();
            match items.iter_mut().find(|e| e.id == entity.id) {
                Some(existing) => *existing = entity.clone(),
                None => items.push(entity.clone()),
            }
        }
        self.mark_dirty(entity.id);
        self.persist()?;
        Ok(entity)
    }

    fn remove_local(&self, id: EntityId) -> Result<()> {
        self.items.write().retain(|e| e.id != id);
        self.mark_dirty(id);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let raw = serde_json::to_string(&*self.items.read())?;
        self.store.set(CACHED_ITEMS_KEY, &raw)
    }
}

fn read_persisted(store: &dyn KeyValueStore) -> Vec<Entity> {
    match store.get(CACHED_ITEMS_KEY) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("Discarding malformed cached items: {}", e);
            Vec::new()
        }),
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::warn!("Failed to read cached items: {}", e);
            Vec::new()
        }
    }
}
