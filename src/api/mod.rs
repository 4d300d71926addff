//! HTTP/JSON adapter: translates API requests 1:1 to core calls and
//! bridges the event bus to WebSocket clients. No business logic lives
//! here.

mod bundles_api;
mod dedupe_api;
mod index_api;
mod queue_api;
mod sources_api;
mod ws;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use crate::Core;
use crate::error::CoreError;

/// Build the full application router.
pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .nest("/api/index", index_api::routes())
        .nest("/api/queue", queue_api::routes())
        .nest("/api/mirror", queue_api::mirror_routes())
        .nest("/api/dedupe", dedupe_api::routes())
        .nest("/api/bundles", bundles_api::routes())
        .route("/ws", get(ws::ws_handler))
        .with_state(core)
}

/// JSON error envelope with a status derived from the error kind.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::PathEscape { .. } | CoreError::Invalid { .. } => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::PolicyDenied { .. } | CoreError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            CoreError::ConflictRefused { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = axum::Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

/// Run a blocking core call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError),
        Err(e) => Err(ApiError(CoreError::Storage {
            message: format!("blocking task failed: {e}"),
        })),
    }
}
