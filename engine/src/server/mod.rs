//! HTTP control service: suite registry, run lifecycle, YAML editing,
//! event streams, and the directory browser.

mod browse;
mod runs;
mod stream;
mod suites;

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use tracing::info;

use crate::events::SharedEventHub;
use crate::paths::StateDirs;
use crate::store::{Store, StoreError};

/// Shared state behind every endpoint.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub hub: SharedEventHub,
    pub dirs: StateDirs,
    /// Binary spawned for run/rerun requests (the `tsuite` CLI)
    pub orchestrator_binary: PathBuf,
    /// Our own base URL, handed to spawned orchestrators for reporting
    pub public_url: String,
}

/// Error type for API handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RunNotFound(_) | StoreError::SuiteNotFound(_) | StoreError::TestNotFound(..) => {
                ApiError::NotFound(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Assemble the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Suites
        .route("/api/suites", get(suites::list).post(suites::register))
        .route("/api/suites/:id", delete(suites::remove))
        .route("/api/suites/:id/sync", post(suites::sync))
        .route("/api/suites/:id/run", post(suites::spawn_run))
        .route(
            "/api/suites/:id/config",
            get(suites::get_config).put(suites::put_config),
        )
        .route(
            "/api/suites/:id/test-yaml",
            get(suites::get_test_yaml).put(suites::put_test_yaml),
        )
        .route(
            "/api/suites/:id/test-step",
            post(suites::add_test_step)
                .put(suites::update_test_step)
                .delete(suites::remove_test_step),
        )
        // Runs
        .route("/api/runs", get(runs::list).post(runs::create))
        .route(
            "/api/runs/:run_id",
            get(runs::get).delete(runs::remove),
        )
        .route("/api/runs/:run_id/test/*test_id", patch(runs::patch_test))
        .route("/api/runs/:run_id/complete", post(runs::complete))
        .route("/api/runs/:run_id/cancel", post(runs::cancel))
        .route("/api/runs/:run_id/rerun", post(runs::rerun))
        .route("/api/runs/:run_id/tests/tree", get(runs::tests_tree))
        .route("/api/runs/:run_id/recount", post(runs::recount))
        // Streams
        .route("/api/events", get(stream::global_stream))
        .route("/api/runs/:run_id/stream", get(stream::run_stream))
        .route("/api/events/emit", post(stream::emit))
        // Browsing
        .route("/api/browse", get(browse::browse))
        .with_state(state)
}

/// Bind an ephemeral local port and serve in a background task. Returns
/// the service's base URL. Used by the CLI when no external control
/// service was given, so a plain `tsuite run` still exercises the full
/// reporting path.
pub async fn spawn_ephemeral(state: AppState) -> anyhow::Result<String> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let url = format!("http://{addr}");
    let state = AppState {
        public_url: url.clone(),
        ..state
    };
    info!(%addr, "embedded control service listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state)).await {
            tracing::error!(error = %e, "embedded control service failed");
        }
    });
    Ok(url)
}

/// Bind and serve until the process exits. Writes the pid and port files
/// so `tsuite stop` can find us.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;

    state.dirs.ensure()?;
    std::fs::write(state.dirs.pid_file(), std::process::id().to_string())?;
    std::fs::write(state.dirs.port_file(), addr.port().to_string())?;

    let state = AppState {
        public_url: format!("http://{addr}"),
        ..state
    };
    info!(%addr, "control service listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
