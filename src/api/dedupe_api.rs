//! Dedupe endpoints: scan submission, scan status/results, execution.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use serde::Deserialize;

use crate::Core;
use crate::config::Side;
use crate::dedupe::{DuplicateGroup, ExecuteReport, KeepSelection, ScanSummary, execute_selections};
use crate::error::CoreError;
use crate::queue::{DedupeMode, Task, TaskPayload};

use super::{ApiError, blocking};

pub fn routes() -> axum::Router<Arc<Core>> {
    axum::Router::new()
        .route("/scan", post(start_scan))
        .route("/scan/status", get(scan_status))
        .route("/scan/latest", get(latest_scan))
        .route("/scan/{id}", delete(clear_scan))
        .route("/results/{scan_id}", get(results))
        .route("/execute", post(execute))
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    side: Side,
    #[serde(default = "default_mode")]
    mode: DedupeMode,
    #[serde(default)]
    min_size_bytes: u64,
}

fn default_mode() -> DedupeMode {
    DedupeMode::Full
}

async fn start_scan(
    State(core): State<Arc<Core>>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let task = core.queue.enqueue(TaskPayload::DedupeScan {
            side: request.side,
            mode: request.mode,
            min_size_bytes: request.min_size_bytes,
        })?;
        Ok(serde_json::json!({ "task_id": task.id, "status": "queued" }))
    })
    .await
    .map(Json)
}

/// The running or queued dedupe scan task, if any.
async fn scan_status(State(core): State<Arc<Core>>) -> Result<Json<Option<Task>>, ApiError> {
    blocking(move || {
        let task = core
            .queue
            .store()
            .list()?
            .into_iter()
            .find(|t| t.task_type == "dedupe_scan" && !t.status.is_terminal());
        Ok(task)
    })
    .await
    .map(Json)
}

async fn latest_scan(State(core): State<Arc<Core>>) -> Result<Json<Option<ScanSummary>>, ApiError> {
    blocking(move || core.dedupe.latest_scan()).await.map(Json)
}

async fn clear_scan(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        if core.dedupe.delete_scan(&id)? {
            Ok(serde_json::json!({ "status": "cleared" }))
        } else {
            Err(CoreError::NotFound {
                path: format!("dedupe scan {id}"),
            })
        }
    })
    .await
    .map(Json)
}

async fn results(
    State(core): State<Arc<Core>>,
    Path(scan_id): Path<String>,
) -> Result<Json<Vec<DuplicateGroup>>, ApiError> {
    blocking(move || {
        if core.dedupe.get_scan(&scan_id)?.is_none() {
            return Err(CoreError::NotFound {
                path: format!("dedupe scan {scan_id}"),
            });
        }
        core.dedupe.groups_for_scan(&scan_id)
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    scan_id: String,
    selections: Vec<KeepSelection>,
}

async fn execute(
    State(core): State<Arc<Core>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteReport>, ApiError> {
    blocking(move || execute_selections(&core, &request.scan_id, &request.selections))
        .await
        .map(Json)
}
