//! Bundle CRUD and asset-management endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use serde::Deserialize;

use crate::Core;
use crate::bundles::{Bundle, BundleAsset, BundleSummary};
use crate::config::Side;
use crate::error::CoreError;
use crate::paths::RelPath;

use super::{ApiError, blocking};

pub fn routes() -> axum::Router<Arc<Core>> {
    axum::Router::new()
        .route("/", get(list).post(create))
        .route("/{name}", get(get_one).delete(delete_one))
        .route("/{name}/assets", put(update_assets).post(add_asset))
        .route("/{name}/assets/{*relpath}", axum::routing::delete(remove_asset))
        .route("/{name}/folder", post(add_folder))
}

async fn list(State(core): State<Arc<Core>>) -> Result<Json<Vec<BundleSummary>>, ApiError> {
    blocking(move || core.bundles.list()).await.map(Json)
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

async fn create(
    State(core): State<Arc<Core>>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<Bundle>, ApiError> {
    blocking(move || core.bundles.create(&request.name, request.description))
        .await
        .map(Json)
}

async fn get_one(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
) -> Result<Json<Bundle>, ApiError> {
    blocking(move || {
        core.bundles.get(&name)?.ok_or_else(|| CoreError::NotFound {
            path: format!("bundle {name}"),
        })
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
struct UpdateAssetsRequest {
    assets: Vec<BundleAsset>,
}

/// Replace the whole asset list.
async fn update_assets(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
    Json(request): Json<UpdateAssetsRequest>,
) -> Result<Json<Bundle>, ApiError> {
    blocking(move || core.bundles.update_assets(&name, request.assets))
        .await
        .map(Json)
}

/// Append (or replace, by relpath) a single asset.
async fn add_asset(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
    Json(asset): Json<BundleAsset>,
) -> Result<Json<Bundle>, ApiError> {
    blocking(move || core.bundles.add_asset(&name, asset))
        .await
        .map(Json)
}

async fn remove_asset(
    State(core): State<Arc<Core>>,
    Path((name, relpath)): Path<(String, String)>,
) -> Result<Json<Bundle>, ApiError> {
    blocking(move || {
        let relpath = RelPath::new(&relpath)?;
        core.bundles.remove_asset(&name, &relpath)
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
struct AddFolderRequest {
    side: Side,
    folder: String,
}

/// Bulk-add every indexed file under a folder, carrying the index hash when
/// one is known. Relpaths already in the bundle are left untouched.
async fn add_folder(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
    Json(request): Json<AddFolderRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let snap = core.index.snapshot(request.side);
        let assets: Vec<BundleAsset> = snap
            .values()
            .filter(|e| e.relpath.is_under(&request.folder))
            .map(|e| BundleAsset {
                relpath: e.relpath.clone(),
                hash: e.hash.clone(),
                source_url_override: None,
            })
            .collect();
        if assets.is_empty() {
            return Err(CoreError::NotFound {
                path: format!("no indexed files under {} on {}", request.folder, request.side),
            });
        }
        let (bundle, added) = core.bundles.add_assets(&name, assets)?;
        Ok(serde_json::json!({ "added": added, "bundle": bundle }))
    })
    .await
    .map(Json)
}

async fn delete_one(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        if core.bundles.delete(&name)? {
            Ok(serde_json::json!({ "status": "deleted" }))
        } else {
            Err(CoreError::NotFound {
                path: format!("bundle {name}"),
            })
        }
    })
    .await
    .map(Json)
}
