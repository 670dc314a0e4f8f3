//! Library sync endpoints for a single integration

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
};
use serde::Serialize;

use crate::AppState;
use crate::api::internal_error;
use crate::services::{PurgeResult, StartSyncResponse, SyncStatusView};

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Start a full sync. Rejections are reported in the body, not as an error status.
async fn start_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StartSyncResponse>), (StatusCode, String)> {
    let response = state.sync.start_full_sync(&id).await.map_err(internal_error)?;
    let status = if response.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(response)))
}

async fn cancel_sync(State(state): State<AppState>, Path(id): Path<String>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.sync.cancel_sync(&id),
    })
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SyncStatusView>, (StatusCode, String)> {
    state
        .sync
        .get_status(&id)
        .await
        .map(Json)
        .map_err(internal_error)
}

/// Remove all indexed items, sync status and cached images of an integration
async fn purge_library(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PurgeResult>, (StatusCode, String)> {
    state
        .sync
        .purge_integration_data(&id)
        .await
        .map(Json)
        .map_err(internal_error)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/integrations/{id}/sync",
            post(start_sync).delete(cancel_sync).get(get_status),
        )
        .route("/integrations/{id}/library", delete(purge_library))
}
