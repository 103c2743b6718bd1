use crate::{multipart::MultipartError, services::storage_layout::UploadError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Message returned for every server-side upload failure. Details only go to the log.
pub const UPLOAD_FAILED: &str = "Upload failed";

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("unexpected failure: {:#}", err);
        AppError::internal(UPLOAD_FAILED)
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(reason) => AppError::bad_request(reason),
            UploadError::Io(err) => {
                tracing::error!("upload I/O failure: {}", err);
                AppError::internal(UPLOAD_FAILED)
            }
            UploadError::Assembly { upload_id, source } => {
                tracing::error!(upload_id = %upload_id, "assembly failed: {}", source);
                AppError::internal(UPLOAD_FAILED)
            }
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        match err {
            MultipartError::Io(err) => {
                tracing::error!("multipart read failure: {}", err);
                AppError::internal(UPLOAD_FAILED)
            }
            other => AppError::bad_request(other.to_string()),
        }
    }
}
