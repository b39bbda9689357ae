//! Routes for the bulk image-sync engine, including the SSE progress stream.

use axum::{
    Router,
    extract::State,
    response::{
        Json as ResponseJson,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use db::models::sync_job::SyncJob;
use serde::{Deserialize, Serialize};
use services::services::image_sync::{SyncOptions, SyncProgress};
use tokio_stream::{Stream, StreamExt, wrappers::WatchStream};
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SyncStatusResponse {
    pub progress: SyncProgress,
    pub last_job: Option<SyncJob>,
}

/// Start a background sync run. 409 if one is already in flight.
pub async fn start_sync(
    State(state): State<AppState>,
    payload: Option<axum::Json<SyncOptions>>,
) -> Result<ResponseJson<ApiResponse<SyncJob>>, ApiError> {
    let options = payload.map(|axum::Json(o)| o).unwrap_or_default();
    let job = state.image_sync.start(options).await?;
    Ok(ResponseJson(ApiResponse::success(job)))
}

pub async fn cancel_sync(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.image_sync.cancel().await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn get_sync_status(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<SyncStatusResponse>>, ApiError> {
    let last_job = SyncJob::find_latest(&state.db.pool).await?;
    Ok(ResponseJson(ApiResponse::success(SyncStatusResponse {
        progress: state.image_sync.progress(),
        last_job,
    })))
}

/// Server-Sent Events stream of progress snapshots, one event per processed
/// item plus a final terminal-state event.
pub async fn stream_sync_progress(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = WatchStream::new(state.image_sync.subscribe())
        .map(|progress| Event::default().event("progress").json_data(&progress));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/sync",
        Router::new()
            .route("/start", post(start_sync))
            .route("/cancel", post(cancel_sync))
            .route("/status", get(get_sync_status))
            .route("/stream", get(stream_sync_progress)),
    )
}
