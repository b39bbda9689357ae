use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use services::services::{image_sync::ImageSyncError, importer::ImporterError};
use thiserror::Error;
use tracing::error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Importer(#[from] ImporterError),
    #[error(transparent)]
    Sync(#[from] ImageSyncError),
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Importer(ImporterError::AlreadyRunning)
            | Self::Sync(ImageSyncError::AlreadyRunning)
            | Self::Sync(ImageSyncError::NotRunning) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::NotFound("business").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Importer(ImporterError::AlreadyRunning).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Sync(ImageSyncError::NotRunning).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Database(sqlx::Error::RowNotFound).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
