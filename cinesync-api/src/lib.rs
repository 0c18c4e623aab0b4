//! HTTP surface and WebSocket sync hub for the CineSync playback
//! coordinator.

pub mod http;
pub mod protocol;
pub mod ws;

pub use http::{create_router, AppState};
pub use ws::hub::{spawn_heartbeat_loop, SyncHub};
