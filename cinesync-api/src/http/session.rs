//! Session validation endpoint, a pure AuthStore passthrough used by the
//! web UI to decide whether a stored token is still worth presenting.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::http::AppState;

#[derive(Debug, Deserialize)]
pub struct ValidateSessionRequest {
    pub token: Option<String>,
}

/// POST /api/validate-session
pub async fn validate_session(
    State(state): State<AppState>,
    Json(req): Json<ValidateSessionRequest>,
) -> Response {
    let Some(token) = req.token.filter(|t| !t.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "valid": false, "error": "Missing token" })),
        )
            .into_response();
    };

    match state.auth.validate_session(&token) {
        Some(session) => Json(json!({
            "valid": true,
            "role": session.role,
            "name": session.name,
        }))
        .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "valid": false, "error": "Invalid or expired session" })),
        )
            .into_response(),
    }
}
