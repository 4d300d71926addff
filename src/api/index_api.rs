//! Index endpoints: refresh, diff, stats, file/folder queries, hash-file
//! and verify submission.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};

use crate::Core;
use crate::config::Side;
use crate::error::CoreError;
use crate::index::{DiffEntry, SideStats, compute_diff, scan_side};
use crate::paths::RelPath;
use crate::queue::TaskPayload;

use super::{ApiError, blocking};

pub fn routes() -> axum::Router<Arc<Core>> {
    axum::Router::new()
        .route("/refresh", post(refresh))
        .route("/diff", get(diff))
        .route("/stats", get(stats))
        .route("/config", get(config))
        .route("/files", get(files))
        .route("/folders", get(folders))
        .route("/hash-file", post(hash_file))
        .route("/verify", post(verify))
        .merge(super::sources_api::routes())
}

// ── Refresh ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    #[serde(default)]
    side: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    started: Vec<Side>,
    already_running: Vec<Side>,
}

/// Kick off background scans; `202 Accepted` since completion arrives via
/// `index_refreshed` events. One scanner per side at a time.
async fn refresh(
    State(core): State<Arc<Core>>,
    Json(request): Json<RefreshRequest>,
) -> Result<(StatusCode, Json<RefreshResponse>), ApiError> {
    let sides: Vec<Side> = match request.side.as_deref() {
        None | Some("both") => vec![Side::Local, Side::Lake],
        Some(raw) => match Side::parse(raw) {
            Some(side) => vec![side],
            None => {
                return Err(ApiError(CoreError::Invalid {
                    message: format!("unknown side {raw:?}"),
                }));
            }
        },
    };

    let mut response = RefreshResponse {
        started: Vec::new(),
        already_running: Vec::new(),
    };
    for side in sides {
        if !core.begin_scan(side) {
            response.already_running.push(side);
            continue;
        }
        response.started.push(side);
        let worker_core = Arc::clone(&core);
        let spawned = std::thread::Builder::new()
            .name(format!("scanner-{side}"))
            .spawn(move || {
                if let Err(e) = scan_side(
                    &worker_core.config,
                    side,
                    &worker_core.cache,
                    &worker_core.index,
                    &worker_core.bus,
                ) {
                    log::error!("scan {side} failed: {e}");
                }
                worker_core.end_scan(side);
            });
        if let Err(e) = spawned {
            core.end_scan(side);
            return Err(ApiError(CoreError::from(e)));
        }
    }
    Ok((StatusCode::ACCEPTED, Json(response)))
}

// ── Diff / stats / config ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DiffQuery {
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

async fn diff(
    State(core): State<Arc<Core>>,
    Query(params): Query<DiffQuery>,
) -> Result<Json<Vec<DiffEntry>>, ApiError> {
    blocking(move || {
        let local = core.index.snapshot(Side::Local);
        let lake = core.index.snapshot(Side::Lake);
        Ok(compute_diff(
            &local,
            &lake,
            params.folder.as_deref(),
            params.query.as_deref(),
        ))
    })
    .await
    .map(Json)
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    local: SideStats,
    lake: SideStats,
}

async fn stats(State(core): State<Arc<Core>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        local: core.index.stats(Side::Local),
        lake: core.index.stats(Side::Lake),
    })
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    local_root: String,
    lake_root: String,
    local_allow_delete: bool,
    lake_allow_delete: bool,
    queue_retry_count: u32,
    hash_workers: u32,
}

async fn config(State(core): State<Arc<Core>>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        local_root: core.config.local.root.display().to_string(),
        lake_root: core.config.lake.root.display().to_string(),
        local_allow_delete: core.config.local.allow_delete_from_sync,
        lake_allow_delete: core.config.lake.allow_delete_from_sync,
        queue_retry_count: core.config.queue_retry_count,
        hash_workers: core.config.hash_workers,
    })
}

// ── File / folder queries ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FilesQuery {
    side: String,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileEntryResponse {
    relpath: RelPath,
    size: u64,
    mtime_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    side: Side,
}

async fn files(
    State(core): State<Arc<Core>>,
    Query(params): Query<FilesQuery>,
) -> Result<Json<Vec<FileEntryResponse>>, ApiError> {
    let side = parse_side(&params.side)?;
    blocking(move || {
        let snap = core.index.snapshot(side);
        let out = snap
            .values()
            .filter(|e| {
                params
                    .folder
                    .as_deref()
                    .is_none_or(|f| e.relpath.is_under(f))
            })
            .filter(|e| {
                params
                    .query
                    .as_deref()
                    .is_none_or(|q| q.is_empty() || e.relpath.as_str().contains(q))
            })
            .map(|e| FileEntryResponse {
                relpath: e.relpath.clone(),
                size: e.size,
                mtime_ms: e.mtime_ms,
                hash: e.hash.clone(),
                side,
            })
            .collect();
        Ok(out)
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
struct FoldersQuery {
    side: String,
    #[serde(default)]
    parent: Option<String>,
}

async fn folders(
    State(core): State<Arc<Core>>,
    Query(params): Query<FoldersQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let side = parse_side(&params.side)?;
    blocking(move || {
        let snap = core.index.snapshot(side);
        let parent = params.parent.as_deref().unwrap_or("").trim_matches('/');
        let mut folders = std::collections::BTreeSet::new();
        for relpath in snap.keys() {
            let Some(suffix) = relpath.strip_folder(parent) else {
                continue;
            };
            if let Some((first, _rest)) = suffix.split_once('/') {
                folders.insert(first.to_string());
            }
        }
        Ok(serde_json::json!({ "folders": folders }))
    })
    .await
    .map(Json)
}

// ── Hash / verify submission ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HashFileQuery {
    relpath: String,
    #[serde(default)]
    side: Option<String>,
}

async fn hash_file(
    State(core): State<Arc<Core>>,
    Query(params): Query<HashFileQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let relpath = RelPath::new(&params.relpath).map_err(ApiError)?;
    let side = match params.side.as_deref() {
        Some(raw) => parse_side(raw)?,
        None => Side::Local,
    };
    blocking(move || {
        let task = core.queue.enqueue(TaskPayload::HashFile { side, relpath })?;
        Ok(serde_json::json!({ "task_id": task.id, "status": "queued" }))
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    side: Option<Side>,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    relpath: Option<RelPath>,
}

async fn verify(
    State(core): State<Arc<Core>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let task = core.queue.enqueue(TaskPayload::Verify {
            side: request.side,
            folder: request.folder,
            relpath: request.relpath,
        })?;
        Ok(serde_json::json!({ "task_id": task.id, "status": "queued" }))
    })
    .await
    .map(Json)
}

pub(super) fn parse_side(raw: &str) -> Result<Side, ApiError> {
    Side::parse(raw).ok_or_else(|| {
        ApiError(CoreError::Invalid {
            message: format!("unknown side {raw:?}"),
        })
    })
}
