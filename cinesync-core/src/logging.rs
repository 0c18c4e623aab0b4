//! Logging bootstrap and periodic stats rollups.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, Level};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Initialize structured logging based on configuration
///
/// Supports both JSON (production) and pretty (development) formats
/// with configurable log levels and optional file output.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(true);

        if let Some(file_path) = &config.file_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            registry.with(json_layer.with_writer(Arc::new(file))).init();
        } else {
            registry.with(json_layer).init();
        }
    } else {
        let pretty_layer = fmt::layer()
            .with_target(true)
            .with_line_number(false)
            .with_file(false);

        if let Some(file_path) = &config.file_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            registry.with(pretty_layer.with_writer(Arc::new(file))).init();
        } else {
            registry.with(pretty_layer).init();
        }
    }

    Ok(())
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

/// Monotone activity counters, summarized periodically by the rollup task.
#[derive(Debug, Default)]
pub struct Stats {
    pub frames_in: AtomicU64,
    pub broadcasts: AtomicU64,
    pub snapshots_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub auth_failures: AtomicU64,
    pub encodes_started: AtomicU64,
    pub encodes_failed: AtomicU64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn totals(&self) -> [u64; 7] {
        [
            self.frames_in.load(Ordering::Relaxed),
            self.broadcasts.load(Ordering::Relaxed),
            self.snapshots_sent.load(Ordering::Relaxed),
            self.send_failures.load(Ordering::Relaxed),
            self.auth_failures.load(Ordering::Relaxed),
            self.encodes_started.load(Ordering::Relaxed),
            self.encodes_failed.load(Ordering::Relaxed),
        ]
    }
}

/// Emit one summary line per `interval`, reporting activity since the
/// previous line. Counters are monotone; the task tracks deltas itself.
pub fn spawn_rollup(stats: Arc<Stats>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it so the first line covers a full window
        ticker.tick().await;

        let mut last = stats.totals();
        loop {
            ticker.tick().await;
            let now = stats.totals();
            let delta = |i: usize| now[i] - last[i];
            info!(
                frames_in = delta(0),
                broadcasts = delta(1),
                snapshots = delta(2),
                send_failures = delta(3),
                auth_failures = delta(4),
                encodes = delta(5),
                encode_failures = delta(6),
                "activity summary"
            );
            last = now;
        }
    })
}
