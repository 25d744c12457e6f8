//! Local HTTP API for editor integrations.
//!
//! # Endpoints
//!
//! | Method   | Path               | Description |
//! |----------|--------------------|-------------|
//! | `POST`   | `/context`         | Gather a context bundle for a cursor position |
//! | `POST`   | `/notify/saved`    | A file was written; invalidate and re-index |
//! | `POST`   | `/notify/deleted`  | A file was removed |
//! | `POST`   | `/buffers`         | Push an unsaved buffer snapshot |
//! | `DELETE` | `/buffers`         | Forget a buffer snapshot |
//! | `GET`    | `/sources`         | Registered sources |
//! | `GET`    | `/sources/health`  | Breaker state and latency per source |
//! | `GET`    | `/index/stats`     | Semantic index size |
//! | `GET`    | `/health`          | Liveness, version and index size |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "file_path must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404).
//!
//! A gather never fails at the HTTP level: partial results come back as a
//! bundle with `status: "degraded"` and warnings.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use context_daemon_core::health::HealthSnapshot;
use context_daemon_core::store::IndexStats;
use context_daemon_core::{CompletionQuery, ContextBundle, Position, SourceId};

use crate::daemon::Daemon;
use crate::sources::SourceInfo;

#[derive(Clone)]
struct AppState {
    daemon: Arc<Daemon>,
}

/// Build the router. Split from [`run_server`] so tests can drive it
/// without binding a socket.
pub fn router(daemon: Arc<Daemon>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/context", post(handle_context))
        .route("/notify/saved", post(handle_saved))
        .route("/notify/deleted", post(handle_deleted))
        .route("/buffers", post(handle_buffer_update).delete(handle_buffer_close))
        .route("/sources", get(handle_sources))
        .route("/sources/health", get(handle_source_health))
        .route("/index/stats", get(handle_index_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { daemon })
}

/// Serve on `[daemon].bind` until `shutdown` resolves.
pub async fn run_server(
    daemon: Arc<Daemon>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let bind_addr = daemon.config().daemon.bind.clone();
    let app = router(daemon);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "context daemon listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn require_path(path: &str) -> Result<(), AppError> {
    if path.trim().is_empty() {
        return Err(bad_request("path must not be empty"));
    }
    Ok(())
}

// ============ POST /context ============

/// Body of `POST /context`.
#[derive(Debug, Deserialize)]
pub struct ContextRequest {
    pub file_path: String,
    pub line: usize,
    pub column: usize,
    #[serde(default)]
    pub language: String,
    /// Requests sharing a session supersede each other.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Restrict this request to a subset of sources.
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    /// Unsaved text of the current file.
    #[serde(default)]
    pub buffer: Option<String>,
}

impl ContextRequest {
    fn into_query(self) -> CompletionQuery {
        let mut query = CompletionQuery::new(
            self.file_path,
            Position {
                line: self.line,
                column: self.column,
            },
            self.language,
        );
        query.session_id = self.session_id;
        query.buffer = self.buffer;
        query.enabled_sources = self
            .sources
            .map(|ids| ids.into_iter().map(SourceId::new).collect::<BTreeSet<_>>());
        query
    }
}

async fn handle_context(
    State(state): State<AppState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<ContextBundle>, AppError> {
    if req.file_path.trim().is_empty() {
        return Err(bad_request("file_path must not be empty"));
    }
    Ok(Json(state.daemon.gather(req.into_query()).await))
}

// ============ Notifications ============

#[derive(Debug, Deserialize)]
struct PathRequest {
    path: String,
}

#[derive(Debug, Deserialize)]
struct BufferRequest {
    path: String,
    text: String,
}

async fn handle_saved(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> Result<StatusCode, AppError> {
    require_path(&req.path)?;
    state.daemon.file_saved(&req.path);
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_deleted(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> Result<StatusCode, AppError> {
    require_path(&req.path)?;
    state.daemon.file_deleted(&req.path);
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_buffer_update(
    State(state): State<AppState>,
    Json(req): Json<BufferRequest>,
) -> Result<StatusCode, AppError> {
    require_path(&req.path)?;
    state.daemon.buffer_update(&req.path, req.text);
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_buffer_close(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> Result<StatusCode, AppError> {
    require_path(&req.path)?;
    state.daemon.buffer_closed(&req.path);
    Ok(StatusCode::NO_CONTENT)
}

// ============ Diagnostics ============

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceInfo>,
}

async fn handle_sources(State(state): State<AppState>) -> Json<SourcesResponse> {
    Json(SourcesResponse {
        sources: state.daemon.sources(),
    })
}

#[derive(Serialize)]
struct SourceHealthResponse {
    sources: Vec<HealthSnapshot>,
}

async fn handle_source_health(State(state): State<AppState>) -> Json<SourceHealthResponse> {
    Json(SourceHealthResponse {
        sources: state.daemon.source_health(),
    })
}

async fn handle_index_stats(State(state): State<AppState>) -> Result<Json<IndexStats>, AppError> {
    state
        .daemon
        .index_stats()
        .map(Json)
        .ok_or_else(|| not_found("semantic index is disabled"))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<IndexStats>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        index: state.daemon.index_stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn daemon() -> Arc<Daemon> {
        let config = parse_config("[embedding]\nprovider = \"disabled\"\n").unwrap();
        Arc::new(Daemon::start(config).await.unwrap())
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn context_returns_bundle_with_pushed_buffer() {
        let daemon = daemon().await;
        let app = router(daemon);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/buffers",
                serde_json::json!({"path": "/virtual/a.rs", "text": "fn a() {}"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(json_request(
                "POST",
                "/context",
                serde_json::json!({
                    "file_path": "/virtual/a.rs",
                    "line": 0,
                    "column": 3,
                    "language": "rust"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "complete");
        assert_eq!(body["items"][0]["content"], "fn a() {}");
        assert_eq!(body["items"][0]["current_file"], true);
    }

    #[tokio::test]
    async fn missing_current_file_is_degraded_not_an_error() {
        let app = router(daemon().await);
        let response = app
            .oneshot(json_request(
                "POST",
                "/context",
                serde_json::json!({"file_path": "/no/such/file.rs", "line": 0, "column": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert!(!body["warnings"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_path_is_bad_request() {
        let app = router(daemon().await);
        let response = app
            .oneshot(json_request(
                "POST",
                "/context",
                serde_json::json!({"file_path": " ", "line": 0, "column": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn index_stats_not_found_when_disabled() {
        let app = router(daemon().await);
        let response = app
            .oneshot(Request::get("/index/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sources_and_health() {
        let app = router(daemon().await);
        let response = app
            .clone()
            .oneshot(Request::get("/sources").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["sources"][0]["id"], "buffer");
        assert_eq!(body["sources"][0]["kind"], "buffer");

        let response = app
            .clone()
            .oneshot(Request::get("/sources/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["sources"][0]["state"], "closed");

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }
}
