//! Sync endpoint routes.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use tandem_engine::protocol::{
    DownloadOpsQuery, DownloadOpsResponse, SnapshotUploadRequest, SnapshotUploadResponse,
    UploadOpsRequest, UploadOpsResponse,
};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_download, handle_snapshot, handle_upload};
use crate::AppState;

/// Create sync routes, mounted under [`super::SYNC_PREFIX`].
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ops", get(download_handler).post(upload_handler))
        .route("/snapshot", post(snapshot_handler))
}

/// GET /api/sync/ops - Operations after `sinceSeq`.
async fn download_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<DownloadOpsQuery>,
) -> Result<Json<DownloadOpsResponse>> {
    let response = handle_download(&state.pool, query, state.config.max_download_limit).await?;
    Ok(Json(response))
}

/// POST /api/sync/ops - Upload operations.
async fn upload_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<UploadOpsRequest>,
) -> Result<Json<UploadOpsResponse>> {
    let response = handle_upload(&state.pool, request, state.config.max_download_limit).await?;
    Ok(Json(response))
}

/// POST /api/sync/snapshot - Replace remote state with a full snapshot.
async fn snapshot_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<SnapshotUploadRequest>,
) -> Result<Json<SnapshotUploadResponse>> {
    let response = handle_snapshot(&state.pool, request).await?;
    Ok(Json(response))
}
