use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub media: MediaConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory of static UI assets served at the root path
    pub ui_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            ui_dir: "./ui".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret granting the operator role. Required.
    pub operator_password: String,
    /// Shared secret granting the viewer role. Required.
    pub viewer_password: String,
    /// Session lifetime in milliseconds (default 7 days)
    pub session_ttl_ms: u64,
    /// Expiry sweep period in seconds (default 1 hour)
    pub sweep_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            operator_password: String::new(),
            viewer_password: String::new(),
            session_ttl_ms: 604_800_000,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Library root: source files at the top level, HLS output under `processed/`
    pub root: String,
    /// Library scan period in seconds
    pub scan_interval_secs: u64,
    /// Encoder binary invoked for unprocessed sources
    pub ffmpeg_bin: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: "./videos".to_string(),
            scan_interval_secs: 60,
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }
}

/// Drift-control and scheduling parameters.
///
/// The shipped interval bounds are deliberately equal, which makes the
/// per-client interval adaptation a configured no-op; widen the bounds to
/// enable it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Drift magnitude below which a client counts as in sync, seconds
    pub drift_low: f64,
    /// Drift magnitude above which a client is syncing poorly, seconds
    pub drift_high: f64,
    /// Drift below which a client counts as behind for rate control, seconds
    pub behind_threshold: f64,
    pub min_sync_interval_ms: u64,
    pub max_sync_interval_ms: u64,
    pub default_sync_interval_ms: u64,
    pub sync_interval_step_ms: u64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub rate_step: f64,
    /// Rate-controller period, milliseconds
    pub rate_tick_ms: u64,
    /// Fraction of behind clients above which the master slows down
    pub behind_fraction_slow: f64,
    /// Fraction of behind clients below which the master speeds back up
    pub behind_fraction_recover: f64,
    /// Liveness sweep period, seconds
    pub heartbeat_interval_secs: u64,
    /// Checks a connection may miss before it is terminated
    pub max_missed_heartbeats: u32,
    /// Time allowed between connection open and a successful auth, seconds
    pub auth_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drift_low: 0.5,
            drift_high: 1.5,
            behind_threshold: -1.0,
            min_sync_interval_ms: 1000,
            max_sync_interval_ms: 1000,
            default_sync_interval_ms: 1000,
            sync_interval_step_ms: 250,
            min_rate: 0.9,
            max_rate: 1.0,
            rate_step: 0.01,
            rate_tick_ms: 1000,
            behind_fraction_slow: 0.25,
            behind_fraction_recover: 0.10,
            heartbeat_interval_secs: 10,
            max_missed_heartbeats: 2,
            auth_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
    /// Period between stats rollup lines, milliseconds
    pub summary_interval_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            summary_interval_ms: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CINESYNC_AUTH__OPERATOR_PASSWORD, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CINESYNC")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Validate the configuration, collecting every violation.
    /// Missing credentials are fatal at startup.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.auth.operator_password.is_empty() {
            errors.push("auth.operator_password is required".to_string());
        }
        if self.auth.viewer_password.is_empty() {
            errors.push("auth.viewer_password is required".to_string());
        }
        if self.media.root.is_empty() {
            errors.push("media.root must not be empty".to_string());
        }
        if self.sync.min_sync_interval_ms > self.sync.max_sync_interval_ms {
            errors.push("sync.min_sync_interval_ms must not exceed sync.max_sync_interval_ms".to_string());
        }
        if self.sync.drift_low >= self.sync.drift_high {
            errors.push("sync.drift_low must be below sync.drift_high".to_string());
        }
        if !(self.sync.min_rate <= self.sync.max_rate && self.sync.min_rate > 0.0) {
            errors.push("sync.min_rate must be positive and not exceed sync.max_rate".to_string());
        }
        if self.sync.max_rate > 1.0 {
            errors.push("sync.max_rate must not exceed 1.0 (never faster than real time)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get listen address
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
