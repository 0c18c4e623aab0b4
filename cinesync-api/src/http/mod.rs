// Module: http
// HTTP surface: session validation, HLS artifacts, health, static UI

pub mod error;
pub mod session;
pub mod video;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use cinesync_core::logging::Stats;
use cinesync_core::service::{AuthStore, StateCore, VideoCatalog};
use cinesync_core::Config;

use crate::ws;
use crate::ws::hub::SyncHub;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthStore>,
    pub core: Arc<StateCore>,
    pub catalog: Arc<VideoCatalog>,
    pub hub: Arc<SyncHub>,
    pub stats: Arc<Stats>,
    pub started_at: Instant,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let ui_dir = state.config.server.ui_dir.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/api/validate-session", post(session::validate_session))
        .route("/video/:stream/*path", get(video::serve_hls))
        .route("/ws", get(ws::ws_handler))
        .fallback_service(ServeDir::new(ui_dir))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint with process uptime
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}
