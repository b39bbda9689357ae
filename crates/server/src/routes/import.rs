//! Routes for triggering and observing Places imports.

use axum::{
    Router,
    extract::State,
    response::Json as ResponseJson,
    routing::{get, post},
};
use services::services::importer::{ImportRequest, ImportSummary};
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

/// Start a background import run for a search query.
pub async fn start_import(
    State(state): State<AppState>,
    axum::Json(payload): axum::Json<ImportRequest>,
) -> Result<ResponseJson<ApiResponse<ImportSummary>>, ApiError> {
    state.importer.start(payload)?;
    Ok(ResponseJson(ApiResponse::success(state.importer.status())))
}

pub async fn get_import_status(
    State(state): State<AppState>,
) -> ResponseJson<ApiResponse<ImportSummary>> {
    ResponseJson(ApiResponse::success(state.importer.status()))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/import",
        Router::new()
            .route("/", post(start_import))
            .route("/status", get(get_import_status)),
    )
}
