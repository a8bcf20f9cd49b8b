//! Directory browser backing the suite registration dialog.
//!
//! Read-only listing with a denylist for system paths; nothing outside
//! plain directory listing is exposed.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, AppState};

/// Path prefixes the browser refuses to enter.
const DENIED_PREFIXES: &[&str] = &["/proc", "/sys", "/dev", "/etc/shadow"];

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

#[derive(Debug, Serialize)]
pub struct BrowseEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    /// True when the directory holds a config.yaml, i.e. looks like a suite
    pub has_config: bool,
}

#[derive(Debug, Serialize)]
pub struct BrowseResponse {
    pub path: String,
    pub parent: Option<String>,
    pub entries: Vec<BrowseEntry>,
}

fn is_denied(path: &str) -> bool {
    DENIED_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

pub async fn browse(
    State(_state): State<AppState>,
    Query(query): Query<BrowseQuery>,
) -> ApiResult<Json<BrowseResponse>> {
    let path = std::path::Path::new(&query.path);
    let canonical = path
        .canonicalize()
        .map_err(|e| ApiError::BadRequest(format!("cannot browse {}: {e}", query.path)))?;
    let canonical_str = canonical.display().to_string();

    if is_denied(&canonical_str) {
        return Err(ApiError::Forbidden(format!("path not browsable: {canonical_str}")));
    }
    if !canonical.is_dir() {
        return Err(ApiError::BadRequest(format!("not a directory: {canonical_str}")));
    }

    let mut entries = Vec::new();
    let read = std::fs::read_dir(&canonical)
        .map_err(|e| ApiError::Internal(format!("cannot read {canonical_str}: {e}")))?;
    for entry in read.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let entry_path = entry.path();
        let is_dir = entry_path.is_dir();
        let full = entry_path.display().to_string();
        if is_denied(&full) {
            continue;
        }
        entries.push(BrowseEntry {
            has_config: is_dir && entry_path.join("config.yaml").is_file(),
            name,
            path: full,
            is_dir,
        });
    }
    entries.sort_by(|a, b| (!a.is_dir, &a.name).cmp(&(!b.is_dir, &b.name)));

    Ok(Json(BrowseResponse {
        parent: canonical.parent().map(|p| p.display().to_string()),
        path: canonical_str,
        entries,
    }))
}
