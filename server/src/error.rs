use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::page;

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to render an HTML error page with a status
/// matching the failure.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The multipart body could not be read (malformed, or over the size cap).
    #[error("Upload rejected: {0}")]
    Multipart(#[from] MultipartError),

    /// The upload could not be written to disk.
    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),

    /// A model or encoder failed while processing a readable video.
    #[error("Processing failed: {0:#}")]
    Pipeline(anyhow::Error),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Multipart(err) => err.status(),
            AppError::Storage(_) | AppError::Pipeline(_) | AppError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(error = %message, "request failed");
        } else {
            tracing::warn!(error = %message, "request rejected");
        }
        (status, Html(page::error(status, &message))).into_response()
    }
}
