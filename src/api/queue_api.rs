//! Queue and mirror endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use serde::Deserialize;

use crate::Core;
use crate::config::Side;
use crate::error::CoreError;
use crate::mirror::{MirrorPlan, execute_plan, plan_mirror};
use crate::paths::RelPath;
use crate::queue::{CancelOutcome, Task};

use super::{ApiError, blocking};

pub fn routes() -> axum::Router<Arc<Core>> {
    axum::Router::new()
        .route("/copy", post(enqueue_copy))
        .route("/delete", post(enqueue_delete))
        .route("/tasks", get(list_tasks))
        .route("/active", get(active_task))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/cancel/all", post(cancel_all))
        .route("/cancel/{id}", post(cancel_one))
        .route("/{id}", delete(remove_task))
}

pub fn mirror_routes() -> axum::Router<Arc<Core>> {
    axum::Router::new()
        .route("/plan", post(mirror_plan))
        .route("/execute", post(mirror_execute))
}

// ── Copy / delete ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CopyRequest {
    src_side: Side,
    src_relpath: RelPath,
    dst_side: Side,
    #[serde(default)]
    dst_relpath: Option<RelPath>,
}

async fn enqueue_copy(
    State(core): State<Arc<Core>>,
    Json(request): Json<CopyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let task = core.queue.enqueue_copy(
            &core.config,
            request.src_side,
            request.src_relpath,
            request.dst_side,
            request.dst_relpath,
        )?;
        Ok(serde_json::json!({ "task_id": task.id, "status": "queued" }))
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    side: Side,
    relpath: RelPath,
}

/// Sync-path delete: policy-gated per side.
async fn enqueue_delete(
    State(core): State<Arc<Core>>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let task = core
            .queue
            .enqueue_delete(&core.config, request.side, request.relpath, false)?;
        Ok(serde_json::json!({ "task_id": task.id, "status": "queued" }))
    })
    .await
    .map(Json)
}

// ── Listing / lifecycle ──────────────────────────────────────────────

async fn list_tasks(State(core): State<Arc<Core>>) -> Result<Json<Vec<Task>>, ApiError> {
    blocking(move || core.queue.store().list()).await.map(Json)
}

async fn active_task(State(core): State<Arc<Core>>) -> Result<Json<Option<Task>>, ApiError> {
    blocking(move || core.queue.store().active()).await.map(Json)
}

async fn pause(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    core.queue.pause();
    Json(serde_json::json!({ "status": "paused" }))
}

async fn resume(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    core.queue.resume();
    Json(serde_json::json!({ "status": "resumed" }))
}

async fn cancel_one(
    State(core): State<Arc<Core>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let status = match core.queue.cancel(id)? {
            CancelOutcome::CancelledPending => "cancelled",
            CancelOutcome::SignalledRunning => "cancelling",
            CancelOutcome::AlreadyFinished(status) => status.as_str(),
            CancelOutcome::NotFound => {
                return Err(CoreError::NotFound {
                    path: format!("task {id}"),
                });
            }
        };
        Ok(serde_json::json!({ "task_id": id, "status": status }))
    })
    .await
    .map(Json)
}

async fn cancel_all(State(core): State<Arc<Core>>) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let cancelled = core.queue.cancel_all()?;
        Ok(serde_json::json!({ "cancelled": cancelled }))
    })
    .await
    .map(Json)
}

async fn remove_task(
    State(core): State<Arc<Core>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        if core.queue.store().remove_pending(id)? {
            Ok(serde_json::json!({ "status": "removed" }))
        } else {
            Err(CoreError::NotFound {
                path: format!("pending task {id}"),
            })
        }
    })
    .await
    .map(Json)
}

// ── Mirror ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MirrorPlanRequest {
    src_side: Side,
    src_folder: String,
    dst_side: Side,
    #[serde(default)]
    dst_folder: Option<String>,
}

async fn mirror_plan(
    State(core): State<Arc<Core>>,
    Json(request): Json<MirrorPlanRequest>,
) -> Result<Json<MirrorPlan>, ApiError> {
    blocking(move || {
        let local = core.index.snapshot(Side::Local);
        let lake = core.index.snapshot(Side::Lake);
        plan_mirror(
            &local,
            &lake,
            request.src_side,
            &request.src_folder,
            request.dst_side,
            request.dst_folder.as_deref(),
            core.config.allow_delete_from_sync(request.dst_side),
        )
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
struct MirrorExecuteRequest {
    plan: MirrorPlan,
    #[serde(default)]
    skip_deletes: bool,
}

async fn mirror_execute(
    State(core): State<Arc<Core>>,
    Json(request): Json<MirrorExecuteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let task_ids = execute_plan(&core, &request.plan, request.skip_deletes)?;
        Ok(serde_json::json!({
            "tasks_enqueued": task_ids.len(),
            "task_ids": task_ids,
        }))
    })
    .await
    .map(Json)
}
