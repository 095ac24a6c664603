//! Durable queue of pending mutations, conflicts and dead letters
//!
//! Every record lives under a fixed key of a [`KeyValueStore`] as a JSON
//! list. Reads never fail: a missing, unreadable or malformed record is
//! treated as empty, so an externally cleared or corrupted store degrades to
//! "nothing queued" instead of an error.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::conflict::ConflictRecord;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::storage::{
    KeyValueStore, CONFLICTS_KEY, DEAD_LETTERS_KEY, LAST_SYNC_KEY, PENDING_KEY,
};
use crate::types::{EntityId, EntityPatch, MutationKind, PendingMutation};

/// What an acknowledged create leaves behind when its entity changed mid-push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateFollowUp {
    /// The entity was left alone
    Settled,
    /// Edited while in flight; the re-queued create now updates the remote entity
    Update(PendingMutation),
    /// Deleted while in flight; the remote entity has to go again
    Delete(PendingMutation),
}

/// Queue store over a durable key-value backend
pub struct QueueStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl QueueStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_system_clock(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    fn read_list<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        match self.store.get(key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Discarding malformed record '{}': {}", key, e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read record '{}': {}", key, e);
                Vec::new()
            }
        }
    }

    fn write_list<T: Serialize>(&self, key: &str, items: &[T]) -> Result<()> {
        let raw = serde_json::to_string(items)?;
        self.store.set(key, &raw)
    }

    // ========================================================================
    // Pending mutations
    // ========================================================================

    /// Queue a mutation, evicting any queued one with the same (entity, kind)
    pub fn enqueue(
        &self,
        kind: MutationKind,
        entity_id: EntityId,
        payload: EntityPatch,
    ) -> Result<PendingMutation> {
        let mutation = PendingMutation {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_id,
            payload,
            timestamp: self.clock.now(),
            retry_count: 0,
        };

        let _guard = self.write_lock.lock();
        let mut pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        pending.retain(|m| !(m.entity_id == entity_id && m.kind == kind));
        pending.push(mutation.clone());
        self.write_list(PENDING_KEY, &pending)?;

        tracing::debug!(
            "Queued {} for entity {} ({} pending)",
            kind,
            entity_id,
            pending.len()
        );
        Ok(mutation)
    }

    /// Remove acknowledged mutations by id
    pub fn dequeue_completed(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let mut pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        pending.retain(|m| !ids.contains(&m.id));
        self.write_list(PENDING_KEY, &pending)
    }

    /// Queued mutations in enqueue order
    pub fn list_pending(&self) -> Vec<PendingMutation> {
        let mut pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        pending.sort_by_key(|m| m.timestamp);
        pending
    }

    /// Queued mutation for an (entity, kind) pair
    pub fn find_pending(&self, entity_id: EntityId, kind: MutationKind) -> Option<PendingMutation> {
        self.read_list::<PendingMutation>(PENDING_KEY)
            .into_iter()
            .find(|m| m.entity_id == entity_id && m.kind == kind)
    }

    /// Bump the retry counter of a queued mutation, returning the updated entry
    pub fn record_failure(&self, id: &str) -> Result<Option<PendingMutation>> {
        let _guard = self.write_lock.lock();
        let mut pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        let updated = pending.iter_mut().find(|m| m.id == id).map(|m| {
            m.retry_count += 1;
            m.clone()
        });
        if updated.is_some() {
            self.write_list(PENDING_KEY, &pending)?;
        }
        Ok(updated)
    }

    /// Point queued mutations at the id the remote assigned to an entity
    pub fn retarget(&self, old_id: EntityId, new_id: EntityId) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        let mut changed = 0;
        for mutation in pending.iter_mut().filter(|m| m.entity_id == old_id) {
            mutation.entity_id = new_id;
            changed += 1;
        }
        if changed > 0 {
            keep_latest_per_pair(&mut pending);
            self.write_list(PENDING_KEY, &pending)?;
        }
        Ok(changed)
    }

    /// Remove an acknowledged create and move its entity to `new_id`
    ///
    /// A create re-queued while the push was in flight becomes an update of
    /// `new_id`; a create discarded in that window becomes a delete of it.
    pub fn acknowledge_create(
        &self,
        mutation_id: &str,
        old_id: EntityId,
        new_id: EntityId,
    ) -> Result<CreateFollowUp> {
        let _guard = self.write_lock.lock();
        let mut pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        let before = pending.len();
        pending.retain(|m| m.id != mutation_id);
        let was_queued = pending.len() != before;

        let requeued = pending
            .iter()
            .position(|m| m.entity_id == old_id && m.kind == MutationKind::Create);
        let follow_up = match requeued {
            Some(pos) => {
                let mut update = pending.remove(pos);
                update.kind = MutationKind::Update;
                update.entity_id = new_id;
                pending.push(update.clone());
                CreateFollowUp::Update(update)
            }
            None if !was_queued && !pending.iter().any(|m| m.entity_id == old_id) => {
                let delete = PendingMutation {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: MutationKind::Delete,
                    entity_id: new_id,
                    payload: EntityPatch::default(),
                    timestamp: self.clock.now(),
                    retry_count: 0,
                };
                pending.push(delete.clone());
                CreateFollowUp::Delete(delete)
            }
            None => CreateFollowUp::Settled,
        };

        for mutation in pending.iter_mut().filter(|m| m.entity_id == old_id) {
            mutation.entity_id = new_id;
        }
        keep_latest_per_pair(&mut pending);
        self.write_list(PENDING_KEY, &pending)?;
        Ok(follow_up)
    }

    /// Drop every queued mutation for an entity
    pub fn discard_for_entity(&self, entity_id: EntityId) -> Result<Vec<PendingMutation>> {
        let _guard = self.write_lock.lock();
        let pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        let (dropped, kept): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|m| m.entity_id == entity_id);
        if !dropped.is_empty() {
            self.write_list(PENDING_KEY, &kept)?;
        }
        Ok(dropped)
    }

    // ========================================================================
    // Dead letters
    // ========================================================================

    /// Move mutations that exhausted their retries out of the queue
    pub fn dead_letter(&self, mutations: &[PendingMutation]) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();

        let mut pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        pending.retain(|m| !mutations.iter().any(|d| d.id == m.id));
        self.write_list(PENDING_KEY, &pending)?;

        let mut dead: Vec<PendingMutation> = self.read_list(DEAD_LETTERS_KEY);
        dead.retain(|m| !mutations.iter().any(|d| d.id == m.id));
        dead.extend(mutations.iter().cloned());
        self.write_list(DEAD_LETTERS_KEY, &dead)?;

        for mutation in mutations {
            tracing::warn!(
                "Dead-lettered {} for entity {} after {} attempts",
                mutation.kind,
                mutation.entity_id,
                mutation.retry_count
            );
        }
        Ok(())
    }

    pub fn list_dead_letters(&self) -> Vec<PendingMutation> {
        self.read_list(DEAD_LETTERS_KEY)
    }

    /// Put a dead letter back in the queue with a fresh retry budget
    pub fn requeue_dead_letter(&self, id: &str) -> Result<Option<PendingMutation>> {
        let _guard = self.write_lock.lock();

        let mut dead: Vec<PendingMutation> = self.read_list(DEAD_LETTERS_KEY);
        let Some(pos) = dead.iter().position(|m| m.id == id) else {
            return Ok(None);
        };
        let mut mutation = dead.remove(pos);
        mutation.retry_count = 0;
        mutation.timestamp = self.clock.now();

        let mut pending: Vec<PendingMutation> = self.read_list(PENDING_KEY);
        pending.retain(|m| !(m.entity_id == mutation.entity_id && m.kind == mutation.kind));
        pending.push(mutation.clone());

        self.write_list(PENDING_KEY, &pending)?;
        self.write_list(DEAD_LETTERS_KEY, &dead)?;
        Ok(Some(mutation))
    }

    pub fn clear_dead_letters(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.store.remove(DEAD_LETTERS_KEY)
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    pub fn list_conflicts(&self) -> Vec<ConflictRecord> {
        self.read_list(CONFLICTS_KEY)
    }

    /// Append new conflicts, never overwriting unresolved ones
    ///
    /// A record describing the same divergence as a stored one is skipped.
    /// Returns the records actually stored.
    pub fn append_conflicts(&self, new: &[ConflictRecord]) -> Result<Vec<ConflictRecord>> {
        if new.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.write_lock.lock();
        let mut conflicts: Vec<ConflictRecord> = self.read_list(CONFLICTS_KEY);

        let mut added = Vec::new();
        for record in new {
            if conflicts.iter().any(|c| c.same_divergence(record)) {
                continue;
            }
            conflicts.push(record.clone());
            added.push(record.clone());
        }

        if !added.is_empty() {
            self.write_list(CONFLICTS_KEY, &conflicts)?;
        }
        Ok(added)
    }

    /// Remove a conflict once something external resolved it
    pub fn remove_conflict(&self, id: &str) -> Result<Option<ConflictRecord>> {
        let _guard = self.write_lock.lock();
        let mut conflicts: Vec<ConflictRecord> = self.read_list(CONFLICTS_KEY);
        let Some(pos) = conflicts.iter().position(|c| c.id == id) else {
            return Ok(None);
        };
        let removed = conflicts.remove(pos);
        self.write_list(CONFLICTS_KEY, &conflicts)?;
        Ok(Some(removed))
    }

    pub fn clear_conflicts(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.store.remove(CONFLICTS_KEY)
    }

    // ========================================================================
    // Sync bookkeeping
    // ========================================================================

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        match self.store.get(LAST_SYNC_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            _ => None,
        }
    }

    pub fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        let raw = serde_json::to_string(&at)?;
        self.store.set(LAST_SYNC_KEY, &raw)
    }

    /// Forget everything: queue, conflicts, dead letters and last sync
    pub fn clear_all(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        for key in [PENDING_KEY, CONFLICTS_KEY, DEAD_LETTERS_KEY, LAST_SYNC_KEY] {
            self.store.remove(key)?;
        }
        tracing::info!("Cleared offline queue");
        Ok(())
    }
}

/// Keep the most recently queued mutation per (entity, kind)
fn keep_latest_per_pair(pending: &mut Vec<PendingMutation>) {
    let mut seen = HashSet::new();
    let mut kept: Vec<PendingMutation> = pending
        .drain(..)
        .rev()
        .filter(|m| seen.insert((m.entity_id, m.kind)))
        .collect();
    kept.reverse();
    *pending = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::storage::MemoryStore;
    use crate::types::Entity;

    fn queue() -> (Arc<MemoryStore>, Arc<FixedClock>, QueueStore) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::at_millis(1_000));
        let queue = QueueStore::new(store.clone(), clock.clone());
        (store, clock, queue)
    }

    #[test]
    fn test_enqueue_replaces_same_pair() {
        let (_, clock, queue) = queue();

        queue
            .enqueue(MutationKind::Update, 7, EntityPatch::title("first"))
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(5));
        let second = queue
            .enqueue(MutationKind::Update, 7, EntityPatch::title("second"))
            .unwrap();

        let pending = queue.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
        assert_eq!(pending[0].payload.title.as_deref(), Some("second"));
    }

    #[test]
    fn test_enqueue_keeps_other_kinds() {
        let (_, clock, queue) = queue();

        queue
            .enqueue(MutationKind::Create, 7, EntityPatch::title("x"))
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(1));
        queue
            .enqueue(MutationKind::Update, 7, EntityPatch::completed(true))
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(1));
        queue
            .enqueue(MutationKind::Update, 8, EntityPatch::completed(true))
            .unwrap();

        let pending = queue.list_pending();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].kind, MutationKind::Create);
        assert!(queue.find_pending(7, MutationKind::Update).is_some());
        assert!(queue.find_pending(7, MutationKind::Delete).is_none());
    }

    #[test]
    fn test_mutation_ids_are_unique() {
        let (_, _, queue) = queue();
        let a = queue
            .enqueue(MutationKind::Update, 1, EntityPatch::default())
            .unwrap();
        let b = queue
            .enqueue(MutationKind::Update, 2, EntityPatch::default())
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_dequeue_completed() {
        let (_, _, queue) = queue();
        let a = queue
            .enqueue(MutationKind::Delete, 1, EntityPatch::default())
            .unwrap();
        queue
            .enqueue(MutationKind::Delete, 2, EntityPatch::default())
            .unwrap();

        queue.dequeue_completed(&[a.id]).unwrap();
        let pending = queue.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, 2);
    }

    #[test]
    fn test_malformed_records_read_as_empty() {
        let (store, _, queue) = queue();
        store.set(PENDING_KEY, "{not json").unwrap();
        store.set(CONFLICTS_KEY, "42").unwrap();
        store.set(LAST_SYNC_KEY, "yesterday").unwrap();

        assert!(queue.list_pending().is_empty());
        assert!(queue.list_conflicts().is_empty());
        assert!(queue.last_sync().is_none());

        // A write after corruption starts from a clean list
        queue
            .enqueue(MutationKind::Update, 1, EntityPatch::default())
            .unwrap();
        assert_eq!(queue.list_pending().len(), 1);
    }

    #[test]
    fn test_record_failure_and_dead_letter() {
        let (_, _, queue) = queue();
        let m = queue
            .enqueue(MutationKind::Update, 3, EntityPatch::completed(true))
            .unwrap();

        let failed = queue.record_failure(&m.id).unwrap().unwrap();
        assert_eq!(failed.retry_count, 1);
        assert!(queue.record_failure("missing").unwrap().is_none());

        queue.dead_letter(&[failed.clone()]).unwrap();
        assert!(queue.list_pending().is_empty());
        assert_eq!(queue.list_dead_letters(), vec![failed.clone()]);

        let requeued = queue.requeue_dead_letter(&failed.id).unwrap().unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert!(queue.list_dead_letters().is_empty());
        assert_eq!(queue.list_pending().len(), 1);
    }

    #[test]
    fn test_retarget_and_discard() {
        let (_, _, queue) = queue();
        queue
            .enqueue(MutationKind::Update, 1001, EntityPatch::title("a"))
            .unwrap();
        queue
            .enqueue(MutationKind::Delete, 1001, EntityPatch::default())
            .unwrap();

        assert_eq!(queue.retarget(1001, 5).unwrap(), 2);
        assert!(queue.list_pending().iter().all(|m| m.entity_id == 5));

        let dropped = queue.discard_for_entity(5).unwrap();
        assert_eq!(dropped.len(), 2);
        assert!(queue.list_pending().is_empty());
    }

    #[test]
    fn test_append_conflicts_skips_duplicates() {
        let (_, clock, queue) = queue();
        let mut local = Entity::new(1, "mine");
        local.cached = true;
        local.last_modified = Some(100);
        let remote = Entity::new(1, "theirs");

        let first = ConflictRecord::new(local.clone(), remote.clone(), clock.now());
        let again = ConflictRecord::new(local, remote, clock.now());

        assert_eq!(queue.append_conflicts(&[first.clone()]).unwrap().len(), 1);
        assert!(queue.append_conflicts(&[again]).unwrap().is_empty());
        assert_eq!(queue.list_conflicts(), vec![first.clone()]);

        assert_eq!(queue.remove_conflict(&first.id).unwrap(), Some(first));
        assert!(queue.list_conflicts().is_empty());
    }

    #[test]
    fn test_retarget_keeps_one_mutation_per_pair() {
        let (_, clock, queue) = queue();
        queue
            .enqueue(MutationKind::Update, 1, EntityPatch::title("older"))
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(1));
        queue
            .enqueue(MutationKind::Update, 1001, EntityPatch::title("newer"))
            .unwrap();

        queue.retarget(1001, 1).unwrap();
        let pending = queue.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.title.as_deref(), Some("newer"));
    }

    #[test]
    fn test_acknowledge_create_settles() {
        let (_, _, queue) = queue();
        let create = queue
            .enqueue(MutationKind::Create, 1001, EntityPatch::title("milk"))
            .unwrap();

        let follow_up = queue.acknowledge_create(&create.id, 1001, 1).unwrap();
        assert_eq!(follow_up, CreateFollowUp::Settled);
        assert!(queue.list_pending().is_empty());
    }

    #[test]
    fn test_acknowledge_create_turns_requeued_create_into_update() {
        let (_, clock, queue) = queue();
        let pushed = queue
            .enqueue(MutationKind::Create, 1001, EntityPatch::title("milk"))
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(5));
        let requeued = queue
            .enqueue(MutationKind::Create, 1001, EntityPatch::title("oat milk"))
            .unwrap();

        let CreateFollowUp::Update(update) = queue.acknowledge_create(&pushed.id, 1001, 1).unwrap()
        else {
            panic!("expected an update follow-up");
        };
        assert_eq!(update.id, requeued.id);
        assert_eq!(update.kind, MutationKind::Update);
        assert_eq!(update.entity_id, 1);
        assert_eq!(update.payload.title.as_deref(), Some("oat milk"));
        assert_eq!(queue.list_pending(), vec![update]);
    }

    #[test]
    fn test_acknowledge_create_after_discard_queues_delete() {
        let (_, _, queue) = queue();
        let pushed = queue
            .enqueue(MutationKind::Create, 1001, EntityPatch::title("milk"))
            .unwrap();
        queue.discard_for_entity(1001).unwrap();

        let CreateFollowUp::Delete(delete) = queue.acknowledge_create(&pushed.id, 1001, 1).unwrap()
        else {
            panic!("expected a delete follow-up");
        };
        assert_eq!(delete.entity_id, 1);
        assert_eq!(queue.list_pending(), vec![delete]);
    }

    #[test]
    fn test_clear_conflicts_and_dead_letters() {
        let (_, clock, queue) = queue();
        let m = queue
            .enqueue(MutationKind::Delete, 2, EntityPatch::default())
            .unwrap();
        queue.dead_letter(&[m]).unwrap();
        let record = ConflictRecord::new(Entity::new(2, "mine"), Entity::new(2, "theirs"), clock.now());
        queue.append_conflicts(&[record]).unwrap();

        queue.clear_conflicts().unwrap();
        assert!(queue.list_conflicts().is_empty());
        assert_eq!(queue.list_dead_letters().len(), 1);

        queue.clear_dead_letters().unwrap();
        assert!(queue.list_dead_letters().is_empty());
        assert!(queue.list_pending().is_empty());
    }

    #[test]
    fn test_clear_all() {
        let (store, clock, queue) = queue();
        queue
            .enqueue(MutationKind::Update, 1, EntityPatch::default())
            .unwrap();
        queue.set_last_sync(clock.now()).unwrap();
        assert_eq!(queue.last_sync(), Some(clock.now()));

        queue.clear_all().unwrap();
        assert!(queue.list_pending().is_empty());
        assert!(queue.last_sync().is_none());
        assert!(store.keys().unwrap().is_empty());
    }
}
