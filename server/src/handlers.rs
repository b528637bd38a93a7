use axum::Json;
use axum::extract::{Multipart, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::page;
use crate::state::AppState;

/// Name of the multipart field carrying the video.
pub const VIDEO_FIELD: &str = "video";

/// GET /
pub async fn index() -> Html<String> {
    Html(page::index())
}

/// POST /upload
///
/// Stores the `video` field under a fresh name, runs the pipeline on the
/// blocking pool and renders the result page. A missing field or an empty
/// filename sends the client back to `/`.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> AppResult<Response> {
    let mut video: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(VIDEO_FIELD) {
            continue; // ignore unknown fields
        }
        let has_name = field.file_name().is_some_and(|name| !name.is_empty());
        let data = field.bytes().await?;
        if has_name {
            video = Some(data.to_vec());
        }
    }

    let Some(bytes) = video else {
        return Ok(Redirect::to("/").into_response());
    };

    let (upload, processed) = tokio::task::spawn_blocking(move || {
        let upload = state.store.persist(&bytes).map_err(AppError::Storage)?;
        info!(file = %upload.file_name, bytes = bytes.len(), "upload stored");
        let processed = state
            .pipeline
            .process_upload(&upload, &state.store)
            .map_err(AppError::Pipeline)?;
        Ok::<_, AppError>((upload, processed))
    })
    .await
    .map_err(|e| AppError::InternalError(format!("pipeline task failed: {e}")))??;

    let output = match &processed {
        Some(video) => {
            info!(
                input = %upload.file_name,
                output = %video.file_name,
                frames = video.summary.frames_written,
                riders = video.summary.riders_classified,
                "upload processed"
            );
            Some(video.file_name.as_str())
        }
        None => {
            warn!(input = %upload.file_name, "upload is not a readable video");
            None
        }
    };

    Ok(Html(page::result(output)).into_response())
}

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
