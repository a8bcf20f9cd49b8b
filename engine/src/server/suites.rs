//! Suite registry and YAML editing endpoints.
//!
//! All config and test edits go through [`YamlDocument`] so comments and
//! key order survive; re-serializing a parsed map is off limits here.

use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{ApiError, ApiResult, AppState};
use crate::config::SuiteConfig;
use crate::discovery::discover_tests;
use crate::store::SuiteRecord;
use crate::yamldoc::YamlDocument;

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<SuiteRecord>>> {
    Ok(Json(state.store.list_suites().await?))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub folder_path: String,
}

/// Register a suite folder: parse its config, discover its tests, persist
/// the registration.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<SuiteRecord>> {
    let record = load_and_store(&state, &request.folder_path).await?;
    info!(suite = %record.name, tests = record.test_count, "suite registered");
    Ok(Json(record))
}

/// Re-read config.yaml and the test tree for an already registered suite.
pub async fn sync(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SuiteRecord>> {
    let suite = state.store.get_suite(id).await?;
    let record = load_and_store(&state, &suite.folder_path).await?;
    Ok(Json(record))
}

async fn load_and_store(state: &AppState, folder_path: &str) -> ApiResult<SuiteRecord> {
    let path = PathBuf::from(folder_path);
    if !path.is_dir() {
        return Err(ApiError::BadRequest(format!(
            "not a directory: {folder_path}"
        )));
    }
    let config = SuiteConfig::load(&path)
        .map_err(|e| ApiError::BadRequest(format!("unreadable suite config: {e}")))?;
    let tests = discover_tests(&path);
    let config_json = serde_json::to_string(config.raw()).unwrap_or_else(|_| "{}".into());
    let name = if config.suite.name.is_empty() {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| folder_path.to_string())
    } else {
        config.suite.name.clone()
    };

    Ok(state
        .store
        .upsert_suite(
            folder_path,
            &name,
            &config.suite.mode,
            &config_json,
            tests.len() as i64,
        )
        .await?)
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.store.delete_suite(id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

#[derive(Debug, Deserialize, Default)]
pub struct SpawnRunRequest {
    #[serde(default)]
    pub uc: Option<String>,
    #[serde(default)]
    pub tc: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SpawnRunResponse {
    pub spawned: bool,
}

/// Launch the orchestrator as a detached subprocess against this service.
pub async fn spawn_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<SpawnRunRequest>,
) -> ApiResult<Json<SpawnRunResponse>> {
    let suite = state.store.get_suite(id).await?;

    let mut cmd = tokio::process::Command::new(&state.orchestrator_binary);
    cmd.arg("run")
        .arg("--suite-path")
        .arg(&suite.folder_path)
        .arg("--api-url")
        .arg(&state.public_url)
        .env("TSUITE_DETACHED", "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(uc) = &request.uc {
        cmd.args(["--uc", uc]);
    }
    if let Some(tc) = &request.tc {
        cmd.args(["--tc", tc]);
    }
    for tag in &request.tags {
        cmd.args(["--tags", tag]);
    }
    if let Some(name) = &request.name {
        cmd.args(["--name", name]);
    }

    cmd.spawn()
        .map_err(|e| ApiError::Internal(format!("failed to spawn orchestrator: {e}")))?;
    info!(suite = %suite.name, "run spawned");
    Ok(Json(SpawnRunResponse { spawned: true }))
}

#[derive(Debug, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

pub async fn get_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<FileContent>> {
    let suite = state.store.get_suite(id).await?;
    let path = PathBuf::from(&suite.folder_path).join("config.yaml");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| ApiError::Internal(format!("unreadable config: {e}")))?;
    Ok(Json(FileContent {
        path: path.display().to_string(),
        content,
    }))
}

/// Merge updates into config.yaml, preserving comments and order.
pub async fn put_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(updates): Json<serde_json::Map<String, Value>>,
) -> ApiResult<Json<FileContent>> {
    let suite = state.store.get_suite(id).await?;
    let path = PathBuf::from(&suite.folder_path).join("config.yaml");
    let mut doc = YamlDocument::load(&path)
        .map_err(|e| ApiError::BadRequest(format!("unreadable config: {e}")))?;
    doc.merge_updates(&updates)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.save(&path)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(FileContent {
        path: path.display().to_string(),
        content: doc.to_text(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct TestFileQuery {
    pub uc: String,
    pub tc: String,
}

fn test_yaml_path(folder: &str, uc: &str, tc: &str) -> ApiResult<PathBuf> {
    // Path segments only; traversal through the query is not a feature.
    for segment in [uc, tc] {
        if segment.contains('/') || segment.contains("..") {
            return Err(ApiError::BadRequest(format!(
                "invalid path segment '{segment}'"
            )));
        }
    }
    let path = FsPath::new(folder)
        .join("suites")
        .join(uc)
        .join(tc)
        .join("test.yaml");
    if !path.is_file() {
        return Err(ApiError::NotFound(format!("no test.yaml for {uc}/{tc}")));
    }
    Ok(path)
}

pub async fn get_test_yaml(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<TestFileQuery>,
) -> ApiResult<Json<FileContent>> {
    let suite = state.store.get_suite(id).await?;
    let path = test_yaml_path(&suite.folder_path, &query.uc, &query.tc)?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(FileContent {
        path: path.display().to_string(),
        content,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TestYamlUpdate {
    pub uc: String,
    pub tc: String,
    pub updates: serde_json::Map<String, Value>,
}

pub async fn put_test_yaml(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<TestYamlUpdate>,
) -> ApiResult<Json<FileContent>> {
    let suite = state.store.get_suite(id).await?;
    let path = test_yaml_path(&suite.folder_path, &request.uc, &request.tc)?;
    let mut doc = YamlDocument::load(&path)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.merge_updates(&request.updates)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.save(&path)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(FileContent {
        path: path.display().to_string(),
        content: doc.to_text(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddStepRequest {
    pub uc: String,
    pub tc: String,
    /// "pre_run", "test", or "post_run"
    pub phase: String,
    #[serde(default)]
    pub index: Option<usize>,
    pub step: Value,
}

pub async fn add_test_step(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<AddStepRequest>,
) -> ApiResult<Json<FileContent>> {
    let suite = state.store.get_suite(id).await?;
    let path = test_yaml_path(&suite.folder_path, &request.uc, &request.tc)?;
    let mut doc = YamlDocument::load(&path)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.add_sequence_item(&request.phase, &request.step, request.index)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.save(&path)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(FileContent {
        path: path.display().to_string(),
        content: doc.to_text(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStepRequest {
    pub uc: String,
    pub tc: String,
    pub phase: String,
    pub index: usize,
    pub updates: serde_json::Map<String, Value>,
}

pub async fn update_test_step(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateStepRequest>,
) -> ApiResult<Json<FileContent>> {
    let suite = state.store.get_suite(id).await?;
    let path = test_yaml_path(&suite.folder_path, &request.uc, &request.tc)?;
    let mut doc = YamlDocument::load(&path)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.update_sequence_item(&request.phase, request.index, &request.updates)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.save(&path)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(FileContent {
        path: path.display().to_string(),
        content: doc.to_text(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RemoveStepRequest {
    pub uc: String,
    pub tc: String,
    pub phase: String,
    pub index: usize,
}

pub async fn remove_test_step(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<RemoveStepRequest>,
) -> ApiResult<Json<FileContent>> {
    let suite = state.store.get_suite(id).await?;
    let path = test_yaml_path(&suite.folder_path, &request.uc, &request.tc)?;
    let mut doc = YamlDocument::load(&path)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.remove_sequence_item(&request.phase, request.index)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    doc.save(&path)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(FileContent {
        path: path.display().to_string(),
        content: doc.to_text(),
    }))
}
