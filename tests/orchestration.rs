//! Cache + queue + orchestrator against a scripted remote
//!
//! Run with: cargo test --test orchestration

use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use tidesync::clock::FixedClock;
use tidesync::network::Connectivity;
use tidesync::remote::{Fault, InMemoryRemote};
use tidesync::storage::{KeyValueStore, MemoryStore, SqliteStore};
use tidesync::sync::{QueueStore, ResolutionStrategy, SyncOrchestrator, SyncResult};
use tidesync::*;

const START_MS: i64 = 1_700_000_000_000;

struct Session {
    remote: Arc<InMemoryRemote>,
    queue: Arc<QueueStore>,
    clock: Arc<FixedClock>,
    connectivity: Connectivity,
    cache: LocalCache,
    orchestrator: SyncOrchestrator,
}

impl Session {
    fn open(store: Arc<dyn KeyValueStore>, remote: Arc<InMemoryRemote>, online: bool) -> Self {
        let clock = Arc::new(FixedClock::at_millis(START_MS));
        let queue = Arc::new(QueueStore::new(store.clone(), clock.clone()));
        let connectivity = Connectivity::new(online);
        let cache = LocalCache::new(
            store,
            queue.clone(),
            remote.clone(),
            connectivity.clone(),
            clock.clone(),
        );
        let orchestrator = SyncOrchestrator::new(remote.clone(), queue.clone(), clock.clone());
        Self {
            remote,
            queue,
            clock,
            connectivity,
            cache,
            orchestrator,
        }
    }

    fn in_memory(remote: InMemoryRemote, online: bool) -> Self {
        Self::open(Arc::new(MemoryStore::new()), Arc::new(remote), online)
    }

    async fn sync(&self) -> SyncResult {
        self.clock.advance(Duration::seconds(1));
        let snapshot = self.cache.begin_sync();
        let result = self.orchestrator.run_sync(&snapshot).await;
        self.cache.apply_sync_result(&result).unwrap();
        result
    }
}

fn seeded(id: EntityId, title: &str, last_modified: Option<i64>) -> Entity {
    let mut e = Entity::new(id, title);
    e.last_modified = last_modified;
    e
}

#[tokio::test]
async fn offline_session_converges_after_reconnect() {
    let s = Session::in_memory(
        InMemoryRemote::with_items(vec![
            seeded(1, "walk dog", None),
            seeded(2, "call mum", None),
        ]),
        true,
    );
    s.cache.load().await.unwrap();
    s.connectivity.set_online(false);

    let milk = s.cache.create("buy milk").await.unwrap();
    s.clock.advance(Duration::milliseconds(10));
    s.cache.toggle(1).await.unwrap();
    s.clock.advance(Duration::milliseconds(10));
    s.cache.delete(2).await.unwrap();
    s.clock.advance(Duration::milliseconds(10));
    s.cache
        .update(milk.id, EntityPatch::title("buy oat milk"))
        .await
        .unwrap();

    assert_eq!(s.queue.list_pending().len(), 3);
    assert!(s.remote.calls().iter().all(|c| c == "fetch_all"));

    s.connectivity.set_online(true);
    let result = s.sync().await;

    assert!(result.success, "pass failed: {:?}", result.error);
    assert_eq!(result.synced_operations.len(), 3);
    assert!(s.queue.list_pending().is_empty());
    assert_eq!(result.remapped_ids.get(&milk.id), Some(&3));

    let remote = s.remote.snapshot();
    assert_eq!(remote.len(), 2);
    assert!(remote.iter().any(|e| e.id == 1 && e.completed));
    assert!(remote.iter().any(|e| e.id == 3 && e.title == "buy oat milk"));

    let local = s.cache.snapshot();
    assert_eq!(local.len(), 2);
    assert!(local
        .iter()
        .all(|e| e.sync_status == ItemSyncStatus::Synced && !e.cached));
    assert_eq!(s.orchestrator.status().pending_changes, 0);
}

#[tokio::test]
async fn queue_and_cache_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        db_path: dir.path().join("offline.db").to_string_lossy().to_string(),
        storage_mode: StorageMode::Local,
    };
    let remote = Arc::new(InMemoryRemote::new());

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(config.clone()).unwrap());
        let s = Session::open(store, remote.clone(), false);
        s.cache.create("survives").await.unwrap();
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(config).unwrap());
    let s = Session::open(store, remote, true);
    assert_eq!(s.cache.len(), 1);
    assert_eq!(s.queue.list_pending().len(), 1);

    let result = s.sync().await;
    assert!(result.success);
    assert_eq!(s.remote.snapshot()[0].title, "survives");
    assert_eq!(s.cache.snapshot()[0].id, 1);
}

#[tokio::test]
async fn conflict_is_recorded_and_resolved() {
    let s = Session::in_memory(
        InMemoryRemote::with_items(vec![seeded(1, "original", Some(START_MS - 1_000))]),
        true,
    );
    s.cache.load().await.unwrap();
    s.connectivity.set_online(false);

    s.clock.advance(Duration::seconds(10));
    s.cache
        .update(1, EntityPatch::title("local edit"))
        .await
        .unwrap();

    // Someone else edits the same item, earlier than our edit
    s.remote.collection().write().update(
        1,
        &EntityPatch::title("remote edit").with_last_modified(START_MS + 5_000),
    );

    // Our push fails, so the conflict stays visible
    s.connectivity.set_online(true);
    s.remote.fail_call("update", Fault::ServerError, 1);
    let result = s.sync().await;

    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].local.title, "local edit");
    assert_eq!(result.conflicts[0].remote.title, "remote edit");
    assert_eq!(s.cache.conflicted().len(), 1);

    // Second pass does not record the same divergence again
    s.remote.fail_call("update", Fault::ServerError, 1);
    let again = s.sync().await;
    assert!(again.conflicts.is_empty());
    assert_eq!(s.queue.list_conflicts().len(), 1);

    let conflict_id = s.queue.list_conflicts()[0].id.clone();
    let resolution = s
        .cache
        .resolve_conflict(&conflict_id, ResolutionStrategy::KeepRemote)
        .unwrap();
    assert_eq!(resolution.entity.title, "remote edit");
    assert!(s.queue.list_conflicts().is_empty());
    assert!(s.queue.list_pending().is_empty());
    assert_eq!(
        s.cache.get(1).unwrap().sync_status,
        ItemSyncStatus::Synced
    );
}

#[tokio::test]
async fn rejected_push_is_dead_lettered_then_retried() {
    let s = Session::in_memory(InMemoryRemote::with_items(vec![seeded(7, "todo", None)]), true);
    s.cache.load().await.unwrap();
    s.connectivity.set_online(false);
    s.cache.toggle(7).await.unwrap();
    s.connectivity.set_online(true);

    s.remote.fail_call("update", Fault::Rejected, 3);
    for _ in 0..2 {
        let result = s.sync().await;
        assert!(!result.success);
        assert!(result.dead_lettered.is_empty());
    }
    let result = s.sync().await;
    assert_eq!(result.dead_lettered.len(), 1);
    assert_eq!(s.cache.get(7).unwrap().sync_status, ItemSyncStatus::Error);
    assert!(s.queue.list_pending().is_empty());

    let dead = s.queue.list_dead_letters();
    assert_eq!(dead[0].retry_count, 3);
    s.queue.requeue_dead_letter(&dead[0].id).unwrap();

    let result = s.sync().await;
    assert!(result.success);
    assert!(s.remote.snapshot()[0].completed);
    assert!(s.queue.list_dead_letters().is_empty());
}

#[tokio::test]
async fn unreachable_remote_leaves_everything_in_place() {
    let s = Session::in_memory(InMemoryRemote::new(), false);
    s.cache.create("queued").await.unwrap();
    let before = s.cache.snapshot();

    s.connectivity.set_online(true);
    s.remote.set_reachable(false);
    let result = s.sync().await;

    assert!(!result.success);
    assert!(result.merged.is_none());
    assert_eq!(s.cache.snapshot(), before);
    assert_eq!(s.queue.list_pending().len(), 1);
    assert!(s.queue.last_sync().is_none());
    assert_eq!(s.orchestrator.status().last_error, result.error);
}
