//! Sync API endpoints
//!
//! Provides endpoints for multi-device synchronization.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::error::Result;
use crate::state::AppState;
use crate::sync::{DeviceSyncStatus, PullRequest, PullResponse, PushRequest, PushResponse};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push", post(push_changes))
        .route("/pull", post(pull_changes))
        .route("/status/:device_id", get(get_sync_status))
}

/// Push local changes to server
///
/// Answers 200 when every change was applied and 207 when any change
/// conflicted or was rejected.
async fn push_changes(
    State(state): State<AppState>,
    Json(req): Json<PushRequest>,
) -> Result<(StatusCode, Json<PushResponse>)> {
    let response = state.sync().push(req).await?;

    let status = if response.is_complete() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };

    Ok((status, Json(response)))
}

/// Pull changes from server
async fn pull_changes(
    State(state): State<AppState>,
    Json(req): Json<PullRequest>,
) -> Result<Json<PullResponse>> {
    let response = state.sync().pull(req).await?;
    Ok(Json(response))
}

/// Get sync history counters for a device
async fn get_sync_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceSyncStatus>> {
    let status = state.sync().status(&device_id).await?;
    Ok(Json(status))
}
