//! HLS artifact serving.
//!
//! Only files under `<root>/processed/` are reachable; the catalog performs
//! component validation and the canonical-prefix check before any bytes are
//! read.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::http::{AppError, AppResult, AppState};

/// GET /video/:stream/*path
pub async fn serve_hls(
    State(state): State<AppState>,
    Path((stream, subpath)): Path<(String, String)>,
) -> AppResult<Response> {
    let subpath = subpath.trim_start_matches('/');
    let (file_path, content_type) = state.catalog.resolve(&stream, subpath).await?;

    let data = tokio::fs::read(&file_path)
        .await
        .map_err(|_| AppError::not_found("Stream artifact not found"))?;

    debug!(stream = %stream, path = %subpath, size = data.len(), "serving HLS artifact");

    // playlists change as streams appear; segments are immutable
    let cache_control = if content_type == "video/mp2t" {
        "public, max-age=90"
    } else {
        "no-cache, no-store"
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from(data))
        .map_err(|_| AppError::internal_server_error("Failed to build response"))
        .map(IntoResponse::into_response)
}
