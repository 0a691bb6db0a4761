use crate::services::image_service::ImageError;
use crate::services::thumbnails::ThumbnailError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

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

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
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

impl From<ImageError> for AppError {
    fn from(err: ImageError) -> Self {
        let status = match &err {
            ImageError::FieldNotFound(_) | ImageError::RecordNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ImageError::FieldAlreadyExists(_) => StatusCode::CONFLICT,
            ImageError::InvalidField { .. }
            | ImageError::InvalidKey
            | ImageError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
            ImageError::Thumbnail(thumb) => match thumb {
                ThumbnailError::Disabled(_) | ThumbnailError::NoFile(_) => StatusCode::BAD_REQUEST,
                ThumbnailError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ThumbnailError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ImageError::MisconfiguredFallback { .. }
            | ImageError::UnsafeStaticPath(_)
            | ImageError::Config(_)
            | ImageError::Sqlx(_)
            | ImageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
