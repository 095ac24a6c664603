//! Remote collection client
//!
//! The sync engine talks to the remote source of truth through the
//! [`RemoteClient`] trait. [`HttpRemoteClient`] speaks the REST surface
//! (`GET/POST/DELETE /todos`, `PUT/DELETE /todos/{id}`); [`InMemoryRemote`]
//! keeps the collection in-process, with fault injection for tests.

#[cfg(feature = "http")]
mod http;
mod memory;
mod retry;

#[cfg(feature = "http")]
pub use http::HttpRemoteClient;
pub use memory::{Collection, Fault, InMemoryRemote};
pub use retry::{with_retry, with_timeout, RetryPolicy};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Entity, EntityId, EntityPatch, NewEntity};

/// CRUD access to the remote collection
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the full remote snapshot
    async fn fetch_all(&self) -> Result<Vec<Entity>>;

    /// Create an entity; the remote assigns its id
    async fn create(&self, input: &NewEntity) -> Result<Entity>;

    /// Apply a partial update, `NotFound` if the id is unknown
    async fn update(&self, id: EntityId, patch: &EntityPatch) -> Result<Entity>;

    /// Delete an entity, returning it; `NotFound` if the id is unknown
    async fn delete(&self, id: EntityId) -> Result<Entity>;

    /// Remove every entity
    async fn clear(&self) -> Result<()>;

    /// Whether the server answers at all
    async fn ping(&self) -> Result<bool>;
}
