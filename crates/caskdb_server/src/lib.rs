//! # CaskDB Server
//!
//! HTTP front end for the CaskDB storage engine.
//!
//! Exposes the store over two routes:
//! - `GET /db/{key}` returns `{"key": ..., "value": ...}` or 404
//! - `POST /db/{key}` with `{"value": ...}` appends a record and returns 201
//!
//! A `/health` route reports liveness for load-balancer probes. The engine's
//! blocking calls run on the tokio blocking pool so handler tasks never stall
//! the async runtime.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use caskdb_core::{CoreError, Db};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// Environment variable that forces `/health` to report failure.
pub const CONF_HEALTH_FAILURE: &str = "CONF_HEALTH_FAILURE";

/// Response body for a successful read.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordResponse {
    /// The key that was looked up.
    pub key: String,
    /// The newest value stored under the key.
    pub value: String,
}

/// Request body for a write.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    /// The value to store.
    pub value: String,
}

/// Application-level error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Key absent from the store (404).
    NotFound(String),
    /// Storage engine failure (500).
    Engine(CoreError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(key) => (StatusCode::NOT_FOUND, format!("no record for key: {key}")),
            Self::Engine(err) => {
                tracing::error!(error = %err, "storage engine request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, message).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self::Engine(err)
    }
}

/// Handle `GET /db/{key}`.
pub async fn handle_get(
    Path(key): Path<String>,
    State(db): State<Arc<Db>>,
) -> Result<Json<RecordResponse>, AppError> {
    tracing::debug!(key, "get request");

    let lookup_key = key.clone();
    let result = tokio::task::spawn_blocking(move || db.get(&lookup_key))
        .await
        .map_err(|e| AppError::Engine(CoreError::corrupt(e.to_string())))?;

    match result {
        Ok(value) => Ok(Json(RecordResponse { key, value })),
        Err(err) if err.is_not_found() => Err(AppError::NotFound(key)),
        Err(err) => Err(err.into()),
    }
}

/// Handle `POST /db/{key}`.
pub async fn handle_put(
    Path(key): Path<String>,
    State(db): State<Arc<Db>>,
    Json(body): Json<PutRequest>,
) -> Result<StatusCode, AppError> {
    tracing::debug!(key, "put request");

    tokio::task::spawn_blocking(move || db.put(&key, &body.value))
        .await
        .map_err(|e| AppError::Engine(CoreError::corrupt(e.to_string())))??;

    Ok(StatusCode::CREATED)
}

/// Handle `GET /health`.
///
/// Reports `OK` unless the `CONF_HEALTH_FAILURE` environment variable is set
/// to `true`, which is used in integration setups to exercise balancer
/// failover.
pub async fn handle_health() -> Response {
    if std::env::var(CONF_HEALTH_FAILURE).as_deref() == Ok("true") {
        (StatusCode::INTERNAL_SERVER_ERROR, "FAILURE").into_response()
    } else {
        (StatusCode::OK, "OK").into_response()
    }
}

/// Create the HTTP router over a shared engine handle.
pub fn create_router(db: Arc<Db>) -> Router {
    Router::new()
        .route("/db/{key}", get(handle_get).post(handle_put))
        .route("/health", get(handle_health))
        .with_state(db)
}

/// Serve the router on `bind_addr` until the process is stopped.
///
/// # Errors
///
/// Returns an I/O error if the listener cannot bind or the server fails.
pub async fn start_server(bind_addr: SocketAddr, db: Arc<Db>) -> std::io::Result<()> {
    let app = create_router(db);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("server listening on {}", bind_addr);
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use caskdb_core::Config;

    fn test_db() -> (tempfile::TempDir, Arc<Db>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().sync_on_rotate(false);
        let db = Arc::new(Db::open_with_config(dir.path(), config).unwrap());
        (dir, db)
    }

    #[tokio::test]
    async fn get_of_missing_key_is_not_found() {
        let (_dir, db) = test_db();
        let result = handle_get(Path("missing".to_owned()), State(db)).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let (_dir, db) = test_db();

        let status = handle_put(
            Path("greeting".to_owned()),
            State(Arc::clone(&db)),
            Json(PutRequest {
                value: "hello".to_owned(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let Json(body) = handle_get(Path("greeting".to_owned()), State(db)).await.unwrap();
        assert_eq!(body.key, "greeting");
        assert_eq!(body.value, "hello");
    }
}
