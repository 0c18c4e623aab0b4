//! Server lifecycle management
//!
//! Wires the sync hub to the state core, starts the background loops
//! (session sweep, library scan, heartbeat, stats rollup), and owns the
//! graceful-shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info};

use cinesync_api::{create_router, spawn_heartbeat_loop, AppState, SyncHub};
use cinesync_core::logging::{spawn_rollup, Stats};
use cinesync_core::service::{AuthStore, StateCore, VideoCatalog};
use cinesync_core::Config;

pub struct CineSyncServer {
    config: Arc<Config>,
    auth: Arc<AuthStore>,
    core: Arc<StateCore>,
    catalog: Arc<VideoCatalog>,
    stats: Arc<Stats>,
}

impl CineSyncServer {
    pub const fn new(
        config: Arc<Config>,
        auth: Arc<AuthStore>,
        core: Arc<StateCore>,
        catalog: Arc<VideoCatalog>,
        stats: Arc<Stats>,
    ) -> Self {
        Self { config, auth, core, catalog, stats }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        // the hub binds the core's observer surface; the core never sees a
        // socket type
        let hub = SyncHub::new(self.stats.clone());
        self.core.set_observer(hub.clone());

        let mut loops: Vec<JoinHandle<()>> = Vec::new();
        loops.push(
            self.auth
                .clone()
                .spawn_sweeper(Duration::from_secs(self.config.auth.sweep_interval_secs)),
        );
        loops.push(
            self.catalog
                .clone()
                .spawn_scanner(Duration::from_secs(self.config.media.scan_interval_secs)),
        );
        loops.push(spawn_heartbeat_loop(
            hub.clone(),
            self.core.clone(),
            Duration::from_secs(self.config.sync.heartbeat_interval_secs),
        ));
        loops.push(spawn_rollup(
            self.stats.clone(),
            Duration::from_millis(self.config.logging.summary_interval_ms),
        ));
        // the rate-control loop is lazy: StateCore starts it on the first play

        let state = AppState {
            config: self.config.clone(),
            auth: self.auth,
            core: self.core,
            catalog: self.catalog,
            hub: hub.clone(),
            stats: self.stats,
            started_at: Instant::now(),
        };
        let router = create_router(state);

        let addr = self.config.listen_address();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("listening on {addr}");

        // on the termination signal: stop the background loops first so
        // nothing mutates state or enqueues frames mid-teardown, then tell
        // every client we are going away; their sockets close, which lets
        // the graceful drain finish
        let shutdown_hub = hub.clone();
        let graceful = async move {
            shutdown_signal().await;
            info!("termination signal received, stopping loops and closing connections");
            for handle in &loops {
                handle.abort();
            }
            shutdown_hub.shutdown_all("server shutting down");
        };

        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(graceful)
            .await?;

        info!("shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
}
