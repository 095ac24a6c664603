//! In-process remote collection
//!
//! [`Collection`] is the authoritative store behind the reference server;
//! [`InMemoryRemote`] exposes one directly as a [`RemoteClient`], with
//! scripted faults and latency for exercising failure paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::RemoteClient;
use crate::error::{Result, SyncError};
use crate::types::{Entity, EntityId, EntityPatch, NewEntity};

/// Authoritative entity collection
#[derive(Debug, Clone)]
pub struct Collection {
    items: Vec<Entity>,
    next_id: EntityId,
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}

impl Collection {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
        }
    }

    pub fn with_items(items: Vec<Entity>) -> Self {
        let next_id = items.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        Self {
            items: items.into_iter().map(Entity::into_synced).collect(),
            next_id,
        }
    }

    pub fn list(&self) -> Vec<Entity> {
        self.items.clone()
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.items.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn create(&mut self, input: &NewEntity) -> Entity {
        let entity = Entity {
            id: self.next_id,
            title: input.title.clone(),
            completed: input.completed.unwrap_or(false),
            cached: false,
            last_modified: input.last_modified,
            sync_status: Default::default(),
        };
        self.next_id += 1;
        self.items.push(entity.clone());
        entity
    }

    pub fn update(&mut self, id: EntityId, patch: &EntityPatch) -> Option<Entity> {
        let entity = self.items.iter_mut().find(|e| e.id == id)?;
        entity.apply_patch(patch);
        Some(entity.clone())
    }

    pub fn delete(&mut self, id: EntityId) -> Option<Entity> {
        let pos = self.items.iter().position(|e| e.id == id)?;
        Some(self.items.remove(pos))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Failure to inject into the next remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Network unreachable
    Unreachable,
    /// Request deadline exceeded
    Timeout,
    /// 5xx answer
    ServerError,
    /// 4xx answer
    Rejected,
}

impl Fault {
    fn into_error(self) -> SyncError {
        match self {
            Fault::Unreachable => SyncError::Transport("remote unreachable".to_string()),
            Fault::Timeout => SyncError::Timeout(0),
            Fault::ServerError => SyncError::from_status(500, "injected server error"),
            Fault::Rejected => SyncError::from_status(400, "injected rejection"),
        }
    }
}

struct ScriptedFault {
    /// Call name prefix the fault applies to; `None` matches any call
    call: Option<String>,
    fault: Fault,
}

/// [`RemoteClient`] over a shared in-process [`Collection`]
pub struct InMemoryRemote {
    collection: Arc<RwLock<Collection>>,
    faults: Mutex<VecDeque<ScriptedFault>>,
    reachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::with_collection(Arc::new(RwLock::new(Collection::new())))
    }

    pub fn with_items(items: Vec<Entity>) -> Self {
        Self::with_collection(Arc::new(RwLock::new(Collection::with_items(items))))
    }

    pub fn with_collection(collection: Arc<RwLock<Collection>>) -> Self {
        Self {
            collection,
            faults: Mutex::new(VecDeque::new()),
            reachable: AtomicBool::new(true),
            latency: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Shared handle to the backing collection
    pub fn collection(&self) -> Arc<RwLock<Collection>> {
        self.collection.clone()
    }

    pub fn snapshot(&self) -> Vec<Entity> {
        self.collection.read().list()
    }

    /// Fail the next call, whatever it is, with `fault`
    pub fn fail_next(&self, fault: Fault) {
        self.faults.lock().push_back(ScriptedFault { call: None, fault });
    }

    /// Fail the next `times` calls whose name starts with `call`
    pub fn fail_call(&self, call: &str, fault: Fault, times: usize) {
        let mut faults = self.faults.lock();
        for _ in 0..times {
            faults.push_back(ScriptedFault {
                call: Some(call.to_string()),
                fault,
            });
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Names of the calls made so far, e.g. `fetch_all`, `update:3`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    async fn enter(&self, call: String) -> Result<()> {
        self.calls.lock().push(call.clone());

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Fault::Unreachable.into_error());
        }
        let mut faults = self.faults.lock();
        let matching = faults.iter().position(|f| match f.call {
            Some(ref prefix) => call.starts_with(prefix.as_str()),
            None => true,
        });
        match matching.and_then(|pos| faults.remove(pos)) {
            Some(scripted) => Err(scripted.fault.into_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn fetch_all(&self) -> Result<Vec<Entity>> {
        self.enter("fetch_all".to_string()).await?;
        Ok(self.collection.read().list())
    }

    async fn create(&self, input: &NewEntity) -> Result<Entity> {
        self.enter("create".to_string()).await?;
        if input.title.trim().is_empty() {
            return Err(SyncError::from_status(400, "title is required"));
        }
        Ok(self.collection.write().create(input))
    }

    async fn update(&self, id: EntityId, patch: &EntityPatch) -> Result<Entity> {
        self.enter(format!("update:{}", id)).await?;
        self.collection
            .write()
            .update(id, patch)
            .ok_or(SyncError::NotFound(id))
    }

    async fn delete(&self, id: EntityId) -> Result<Entity> {
        self.enter(format!("delete:{}", id)).await?;
        self.collection
            .write()
            .delete(id)
            .ok_or(SyncError::NotFound(id))
    }

    async fn clear(&self) -> Result<()> {
        self.enter("clear".to_string()).await?;
        self.collection.write().clear();
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        self.calls.lock().push("ping".to_string());
        if self.reachable.load(Ordering::SeqCst) {
            Ok(true)
        } else {
            Err(Fault::Unreachable.into_error())
        }
    }
}
