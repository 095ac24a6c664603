//! Reference REST server for the synchronized collection
//!
//! Serves a single in-memory collection:
//!
//! - `GET /health`
//! - `GET {path}` lists, `POST {path}` creates, `DELETE {path}` clears
//! - `PUT {path}/{id}` patches, `DELETE {path}/{id}` removes

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::remote::Collection;
use crate::types::{Entity, EntityId, EntityPatch, NewEntity};

/// Collection shared between the server and in-process clients
pub type SharedCollection = Arc<RwLock<Collection>>;

type ApiError = (StatusCode, String);

/// HTTP server over a [`Collection`]
pub struct CollectionServer {
    collection: SharedCollection,
    path: String,
}

impl CollectionServer {
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_collection(Arc::new(RwLock::new(Collection::new())), path)
    }

    pub fn with_collection(collection: SharedCollection, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = format!("/{}", path.trim_matches('/'));
        Self { collection, path }
    }

    pub fn collection(&self) -> SharedCollection {
        self.collection.clone()
    }

    pub fn snapshot(&self) -> Vec<Entity> {
        self.collection.read().list()
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(
                &self.path,
                get(list_handler)
                    .post(create_handler)
                    .delete(clear_handler),
            )
            .route(
                &format!("{}/:id", self.path),
                put(update_handler).delete(delete_handler),
            )
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.collection.clone())
    }

    /// Bind `addr` and serve until the process exits
    pub async fn serve(self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run(self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(
            "Collection server listening on {} (path {})",
            listener.local_addr()?,
            self.path
        );
        axum::serve(listener, self.router()).await
    }
}

async fn health_handler(State(collection): State<SharedCollection>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "items": collection.read().len(),
    }))
}

async fn list_handler(State(collection): State<SharedCollection>) -> Json<Vec<Entity>> {
    Json(collection.read().list())
}

async fn create_handler(
    State(collection): State<SharedCollection>,
    Json(input): Json<NewEntity>,
) -> Result<(StatusCode, Json<Entity>), ApiError> {
    if input.title.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "title is required".to_string()));
    }
    let created = collection.write().create(&input);
    tracing::debug!("Created entity {}", created.id);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn clear_handler(State(collection): State<SharedCollection>) -> StatusCode {
    collection.write().clear();
    StatusCode::NO_CONTENT
}

async fn update_handler(
    State(collection): State<SharedCollection>,
    Path(id): Path<EntityId>,
    Json(patch): Json<EntityPatch>,
) -> Result<Json<Entity>, ApiError> {
    collection
        .write()
        .update(id, &patch)
        .map(Json)
        .ok_or_else(|| not_found(id))
}

async fn delete_handler(
    State(collection): State<SharedCollection>,
    Path(id): Path<EntityId>,
) -> Result<Json<Entity>, ApiError> {
    collection
        .write()
        .delete(id)
        .map(Json)
        .ok_or_else(|| not_found(id))
}

fn not_found(id: EntityId) -> ApiError {
    (StatusCode::NOT_FOUND, format!("entity {} not found", id))
}
