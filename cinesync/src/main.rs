mod server;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use cinesync_core::{
    logging,
    service::{AuthStore, FfmpegEncoder, StateCore, VideoCatalog},
    Config,
};

use server::CineSyncServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration (environment, plus an optional file named by
    //    CINESYNC_CONFIG)
    let config_file = std::env::var("CINESYNC_CONFIG").ok();
    let config = Config::load(config_file.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        std::process::exit(1);
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("CineSync server starting...");
    info!("listen address: {}", config.listen_address());
    info!("media root: {}", config.media.root);

    // 4. Construct services: auth → state core → catalog
    let stats = logging::Stats::new();
    let auth = Arc::new(AuthStore::new(
        config.auth.operator_password.clone(),
        config.auth.viewer_password.clone(),
        config.auth.session_ttl_ms,
    ));
    let core = StateCore::new(config.sync.clone(), stats.clone());
    let encoder = Arc::new(FfmpegEncoder::new(config.media.ffmpeg_bin.clone()));
    let catalog =
        Arc::new(VideoCatalog::new(config.media.root.clone(), encoder, stats.clone()).await?);

    // 5. Run: the server wires the sync hub, starts the background loops,
    //    and owns the shutdown sequence
    let server = CineSyncServer::new(Arc::new(config), auth, core, catalog, stats);
    server.run().await
}
