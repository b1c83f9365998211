//! Read-only HTTP status API.
//!
//! Stages run asynchronously with no caller to report to, so progress and
//! failures are visible only through the status store. This server exposes
//! the same queries as `docflow status`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/status?path=…&verbose=…` | One document with its chunk logs |
//! | `GET`  | `/status/list?within_hours=…&state=…` | Documents started in a window |
//!
//! Errors use `{ "error": { "code": "...", "message": "..." } }` with codes
//! `bad_request` (400), `not_found` (404) and `internal` (500).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use docflow_core::models::{DocumentStatusRecord, StatusQueryLevel};
use docflow_core::store::StatusBackend;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;
use crate::status_cmd::{get_status, list_status, parse_state, DocumentStatus};

#[derive(Clone)]
struct AppState {
    backend: Arc<dyn StatusBackend>,
}

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let app = router(Arc::new(SqliteStore::new(pool)));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!("status server listening on http://{}", config.server.bind);
    println!("Status server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(backend: Arc<dyn StatusBackend>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/status/list", get(handle_list))
        .layer(cors)
        .with_state(AppState { backend })
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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /status ============

#[derive(Deserialize)]
struct StatusParams {
    path: Option<String>,
    #[serde(default)]
    verbose: bool,
}

async fn handle_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Result<Json<DocumentStatus>, AppError> {
    let path = params
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| bad_request("path must not be empty"))?;
    let level = if params.verbose {
        StatusQueryLevel::Verbose
    } else {
        StatusQueryLevel::Concise
    };
    get_status(state.backend, &path, level)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("no status recorded for {}", path)))
}

// ============ GET /status/list ============

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "unbounded")]
    within_hours: i64,
    state: Option<String>,
}

fn unbounded() -> i64 {
    -1
}

async fn handle_list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DocumentStatusRecord>>, AppError> {
    let filter = params
        .state
        .as_deref()
        .map(parse_state)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;
    let records = list_status(state.backend, params.within_hours, filter)
        .await
        .map_err(internal)?;
    Ok(Json(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::models::State as DocState;
    use docflow_core::status_log::{StatusEntry, StatusLog};
    use docflow_core::store::memory::InMemoryStore;

    async fn spawn(backend: Arc<dyn StatusBackend>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(backend)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_status_endpoints() {
        let store = Arc::new(InMemoryStore::new());
        let mut log = StatusLog::new(store.clone());
        log.upsert("upload/a.pdf", StatusEntry::info("queued").state(DocState::Queued))
            .await;
        log.save("upload/a.pdf").await.unwrap();
        let base = spawn(store).await;
        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let doc: serde_json::Value = client
            .get(format!("{}/status?path=upload/a.pdf", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(doc["state"], "Queued");
        assert_eq!(doc["file_name"], "a.pdf");

        let missing = client
            .get(format!("{}/status?path=upload/nope.pdf", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let list: Vec<serde_json::Value> = client
            .get(format!("{}/status/list?state=Queued", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list.len(), 1);

        let bad = client
            .get(format!("{}/status/list?state=Done", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status().as_u16(), 400);
        let body: serde_json::Value = bad.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }
}
