//! Snapshot reconciliation
//!
//! Timestamp-ordered last-writer-wins merge of a local and a remote snapshot.
//! When the local side cannot be shown to be older it is kept, and when it is
//! strictly newer than a diverging remote copy the pair is surfaced as a
//! [`ConflictRecord`] instead of silently dropping either side.
//!
//! Per remote item R:
//! 1. no local item with R's id: adopt R as `synced`
//! 2. local L not `cached`: adopt R as `synced`
//! 3. L `cached`, both timestamped: L strictly newer keeps L as `conflict`
//!    (with a record), otherwise adopt R as `synced`; ties go to the remote
//! 4. L `cached`, timestamps missing: keep L as `pending`
//!
//! Local-only items are kept as `pending`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::conflict::ConflictRecord;
use crate::types::{Entity, EntityId, ItemSyncStatus};

/// Output of one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub merged: Vec<Entity>,
    pub conflicts: Vec<ConflictRecord>,
}

/// Merge two snapshots; `detected_at` stamps any new conflict records
///
/// Output order is remote order followed by local-only items in local order.
pub fn reconcile(local: &[Entity], remote: &[Entity], detected_at: DateTime<Utc>) -> Reconciliation {
    let local_by_id: HashMap<EntityId, &Entity> = local.iter().map(|e| (e.id, e)).collect();
    let mut seen: HashSet<EntityId> = HashSet::with_capacity(remote.len());
    let mut merged = Vec::with_capacity(remote.len().max(local.len()));
    let mut conflicts = Vec::new();

    for r in remote {
        if !seen.insert(r.id) {
            tracing::warn!("Remote snapshot repeats entity {}, keeping first", r.id);
            continue;
        }

        let Some(l) = local_by_id.get(&r.id) else {
            merged.push(r.clone().into_synced());
            continue;
        };

        if !l.cached {
            merged.push(r.clone().into_synced());
            continue;
        }

        match (l.last_modified, r.last_modified) {
            (Some(local_ts), Some(remote_ts)) if local_ts > remote_ts => {
                let kept = (*l).clone().with_status(ItemSyncStatus::Conflict);
                // An item already in conflict has its record stored
                if l.sync_status != ItemSyncStatus::Conflict {
                    conflicts.push(ConflictRecord::new(kept.clone(), r.clone(), detected_at));
                }
                merged.push(kept);
            }
            (Some(_), Some(_)) => merged.push(r.clone().into_synced()),
            _ => merged.push((*l).clone().with_status(ItemSyncStatus::Pending)),
        }
    }

    for l in local {
        if !seen.contains(&l.id) {
            seen.insert(l.id);
            merged.push(l.clone().with_status(ItemSyncStatus::Pending));
        }
    }

    if !conflicts.is_empty() {
        tracing::info!("Reconciliation found {} new conflicts", conflicts.len());
    }

    Reconciliation { merged, conflicts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn remote(id: EntityId, title: &str, ts: Option<i64>) -> Entity {
        let mut e = Entity::new(id, title);
        e.last_modified = ts;
        e
    }

    fn cached(id: EntityId, title: &str, ts: Option<i64>) -> Entity {
        let mut e = Entity::new(id, title);
        e.cached = true;
        e.last_modified = ts;
        e.sync_status = ItemSyncStatus::Pending;
        e
    }

    #[test]
    fn test_remote_only_adopted_verbatim() {
        let r = remote(1, "from server", Some(10));
        let out = reconcile(&[], &[r.clone()], Utc::now());

        assert_eq!(out.merged, vec![r.into_synced()]);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_uncached_local_replaced_by_remote() {
        let mut l = Entity::new(1, "stale");
        l.last_modified = Some(999);
        let r = remote(1, "fresh", None);

        let out = reconcile(&[l], &[r.clone()], Utc::now());
        assert_eq!(out.merged, vec![r.into_synced()]);
    }

    #[test]
    fn test_local_newer_becomes_conflict() {
        let l = cached(1, "mine", Some(100));
        let r = remote(1, "theirs", Some(50));

        let out = reconcile(&[l.clone()], &[r.clone()], Utc::now());

        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.merged[0].title, "mine");
        assert_eq!(out.merged[0].sync_status, ItemSyncStatus::Conflict);
        assert!(out.merged[0].cached);

        assert_eq!(out.conflicts.len(), 1);
        let record = &out.conflicts[0];
        assert_eq!(record.entity_id, 1);
        assert_eq!(record.local.title, "mine");
        assert_eq!(record.remote, r);
    }

    #[test]
    fn test_remote_newer_wins() {
        let l = cached(1, "mine", Some(50));
        let r = remote(1, "theirs", Some(100));

        let out = reconcile(&[l], &[r.clone()], Utc::now());
        assert_eq!(out.merged, vec![r.into_synced()]);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_equal_timestamps_favor_remote() {
        let l = cached(1, "mine", Some(100));
        let r = remote(1, "theirs", Some(100));

        let out = reconcile(&[l], &[r.clone()], Utc::now());
        assert_eq!(out.merged, vec![r.into_synced()]);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_missing_timestamp_keeps_local_pending() {
        let l = cached(1, "mine", Some(100));
        let r = remote(1, "theirs", None);

        let out = reconcile(&[l.clone()], &[r], Utc::now());
        assert_eq!(out.merged, vec![l]);
        assert!(out.conflicts.is_empty());

        let l = cached(2, "mine", None);
        let r = remote(2, "theirs", Some(1));
        let out = reconcile(&[l.clone()], &[r], Utc::now());
        assert_eq!(out.merged[0].title, "mine");
        assert_eq!(out.merged[0].sync_status, ItemSyncStatus::Pending);
    }

    #[test]
    fn test_local_only_kept_pending_after_remote_items() {
        let offline = cached(1001, "buy milk", Some(5));
        let r = remote(1, "server", None);

        let out = reconcile(&[offline.clone()], &[r], Utc::now());
        assert_eq!(out.merged.len(), 2);
        assert_eq!(out.merged[0].id, 1);
        assert_eq!(out.merged[1], offline);
    }

    #[test]
    fn test_rerun_on_output_is_stable() {
        let local = vec![
            cached(1, "mine", Some(100)),
            cached(2, "offline", None),
            Entity::new(3, "plain"),
        ];
        let remote_items = vec![
            remote(1, "theirs", Some(50)),
            remote(3, "plain v2", None),
            remote(4, "new", None),
        ];

        let first = reconcile(&local, &remote_items, Utc::now());
        assert_eq!(first.conflicts.len(), 1);

        let second = reconcile(&first.merged, &remote_items, Utc::now());
        assert_eq!(second.merged, first.merged);
        assert!(second.conflicts.is_empty());
    }

    #[test]
    fn test_synced_items_never_cached() {
        let local = vec![cached(1, "a", Some(1)), cached(2, "b", None)];
        let remote_items = vec![remote(1, "a2", Some(2)), remote(3, "c", None)];

        let out = reconcile(&local, &remote_items, Utc::now());
        for item in &out.merged {
            if item.sync_status == ItemSyncStatus::Synced {
                assert!(!item.cached, "synced item {} still cached", item.id);
            }
        }
    }
}
