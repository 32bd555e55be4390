use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use identint_store::StoreError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::upload::UploadError;
use crate::views;

/// Handler error rendered as an HTML error page.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("not found")]
    NotFound,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound | AppError::Store(StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, views::not_found()).into_response()
            }
            err => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, views::server_error()).into_response()
            }
        }
    }
}
