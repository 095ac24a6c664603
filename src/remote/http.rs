//! REST client for the remote collection

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::retry::{with_retry, with_timeout, RetryPolicy};
use super::RemoteClient;
use crate::error::{Result, SyncError};
use crate::types::{Entity, EntityId, EntityPatch, NewEntity, SyncConfig};

/// reqwest-backed [`RemoteClient`]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    collection_url: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpRemoteClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            collection_url: config.collection_url(),
            retry: RetryPolicy::from_config(config),
            timeout,
        })
    }

    /// Override the retry schedule
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn item_url(&self, id: EntityId) -> String {
        format!("{}/{}", self.collection_url, id)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let send = async { request.send().await.map_err(SyncError::from) };
        let response = with_timeout(self.timeout, send).await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::from_status(
            status.as_u16(),
            format!("Status {}: {}", status, body),
        ))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Internal(format!("Failed to parse response: {}", e)))
    }
}

fn not_found_as(id: EntityId) -> impl Fn(SyncError) -> SyncError {
    move |e| match e.status() {
        Some(404) => SyncError::NotFound(id),
        _ => e,
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn fetch_all(&self) -> Result<Vec<Entity>> {
        with_retry(&self.retry, "fetch collection", || {
            self.send_json(self.client.get(&self.collection_url))
        })
        .await
    }

    async fn create(&self, input: &NewEntity) -> Result<Entity> {
        with_retry(&self.retry, "create entity", || {
            self.send_json(self.client.post(&self.collection_url).json(input))
        })
        .await
    }

    async fn update(&self, id: EntityId, patch: &EntityPatch) -> Result<Entity> {
        with_retry(&self.retry, "update entity", || {
            self.send_json(self.client.put(self.item_url(id)).json(patch))
        })
        .await
        .map_err(not_found_as(id))
    }

    async fn delete(&self, id: EntityId) -> Result<Entity> {
        with_retry(&self.retry, "delete entity", || {
            self.send_json(self.client.delete(self.item_url(id)))
        })
        .await
        .map_err(not_found_as(id))
    }

    async fn clear(&self) -> Result<()> {
        with_retry(&self.retry, "clear collection", || async {
            self.send(self.client.delete(&self.collection_url)).await?;
            Ok::<(), SyncError>(())
        })
        .await
    }

    async fn ping(&self) -> Result<bool> {
        let request = self.client.head(&self.collection_url);
        let send = async { request.send().await.map_err(SyncError::from) };
        let response = with_timeout(self.timeout, send).await?;
        Ok(response.status().is_success())
    }
}
