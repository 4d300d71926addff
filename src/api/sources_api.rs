//! Source-URL endpoints, mounted under `/api/index/sources`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::get;
use serde::{Deserialize, Serialize};

use crate::Core;
use crate::config::Side;
use crate::error::CoreError;
use crate::paths::RelPath;
use crate::queue::TaskPayload;
use crate::sources::{SourceEntry, relpath_key};

use super::{ApiError, blocking};

pub fn routes() -> axum::Router<Arc<Core>> {
    axum::Router::new()
        .route("/sources", get(list_sources))
        .route(
            "/sources/by-relpath/{*relpath}",
            get(get_by_relpath).put(set_by_relpath).delete(delete_by_relpath),
        )
        .route(
            "/sources/{hash}",
            get(get_by_hash).put(set_by_hash).delete(delete_by_hash),
        )
}

#[derive(Debug, Serialize)]
struct SourceResponse {
    key: String,
    url: String,
    added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename_hint: Option<String>,
}

impl SourceResponse {
    fn from_entry(key: String, entry: SourceEntry) -> SourceResponse {
        SourceResponse {
            key,
            url: entry.url,
            added_at: entry.added_at,
            notes: entry.notes,
            filename_hint: entry.filename_hint,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SetSourceRequest {
    url: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    filename_hint: Option<String>,
    /// by-relpath only: also enqueue a hash task so the entry can later be
    /// re-keyed by digest.
    #[serde(default)]
    queue_hash: bool,
}

fn build_entry(request: &SetSourceRequest) -> Result<SourceEntry, CoreError> {
    if request.url.trim().is_empty() {
        return Err(CoreError::Invalid {
            message: "url cannot be empty".into(),
        });
    }
    Ok(SourceEntry {
        url: request.url.trim().to_string(),
        added_at: chrono::Utc::now().to_rfc3339(),
        notes: request.notes.clone(),
        filename_hint: request.filename_hint.clone(),
    })
}

async fn list_sources(State(core): State<Arc<Core>>) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let sources: Vec<SourceResponse> = core
            .sources
            .all()?
            .into_iter()
            .map(|(key, entry)| SourceResponse::from_entry(key, entry))
            .collect();
        Ok(serde_json::json!({ "sources": sources }))
    })
    .await
    .map(Json)
}

/// Single lookup by content hash; `null` when no source URL is set.
async fn get_by_hash(
    State(core): State<Arc<Core>>,
    Path(hash): Path<String>,
) -> Result<Json<Option<SourceResponse>>, ApiError> {
    blocking(move || {
        Ok(core
            .sources
            .get(&hash)?
            .map(|entry| SourceResponse::from_entry(hash, entry)))
    })
    .await
    .map(Json)
}

/// Single lookup by relpath fallback key; `null` when no source URL is set.
async fn get_by_relpath(
    State(core): State<Arc<Core>>,
    Path(relpath): Path<String>,
) -> Result<Json<Option<SourceResponse>>, ApiError> {
    blocking(move || {
        let relpath = RelPath::new(&relpath)?;
        let key = relpath_key(&relpath);
        Ok(core
            .sources
            .get(&key)?
            .map(|entry| SourceResponse::from_entry(key, entry)))
    })
    .await
    .map(Json)
}

async fn set_by_hash(
    State(core): State<Arc<Core>>,
    Path(hash): Path<String>,
    Json(request): Json<SetSourceRequest>,
) -> Result<Json<SourceResponse>, ApiError> {
    blocking(move || {
        let entry = build_entry(&request)?;
        core.sources.set(&hash, entry.clone())?;
        Ok(SourceResponse::from_entry(hash, entry))
    })
    .await
    .map(Json)
}

async fn set_by_relpath(
    State(core): State<Arc<Core>>,
    Path(relpath): Path<String>,
    Json(request): Json<SetSourceRequest>,
) -> Result<Json<SourceResponse>, ApiError> {
    blocking(move || {
        let relpath = RelPath::new(&relpath)?;
        let entry = build_entry(&request)?;
        let key = relpath_key(&relpath);
        core.sources.set(&key, entry.clone())?;
        if request.queue_hash {
            // Hash against the Lake copy; sources live with the Lake by design.
            core.queue.enqueue(TaskPayload::HashFile {
                side: Side::Lake,
                relpath,
            })?;
        }
        Ok(SourceResponse::from_entry(key, entry))
    })
    .await
    .map(Json)
}

async fn delete_by_hash(
    State(core): State<Arc<Core>>,
    Path(hash): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        if core.sources.remove(&hash)? {
            Ok(serde_json::json!({ "status": "deleted" }))
        } else {
            Err(CoreError::NotFound {
                path: format!("source {hash}"),
            })
        }
    })
    .await
    .map(Json)
}

async fn delete_by_relpath(
    State(core): State<Arc<Core>>,
    Path(relpath): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let relpath = RelPath::new(&relpath)?;
        if core.sources.remove(&relpath_key(&relpath))? {
            Ok(serde_json::json!({ "status": "deleted" }))
        } else {
            Err(CoreError::NotFound {
                path: format!("source for {relpath}"),
            })
        }
    })
    .await
    .map(Json)
}
