//! Configuration management for fitsync
//!
//! Configuration is layered: defaults, then an optional TOML file, then
//! `FITSYNC_<SECTION>_<KEY>` environment overrides. Every duration uses
//! humantime notation in files (`"15s"`, `"2h"`).

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

mod error;
mod feature_flags;

pub use error::ConfigError;
pub use feature_flags::{FeatureFlags, FeatureManager};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server of record endpoints
    pub server: ServerConfig,

    /// Resilient connection tuning
    pub connection: ConnectionConfig,

    /// Group state store tuning
    pub store: StoreConfig,

    /// Orchestrator timers
    pub sync: SyncConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Client capability flags
    pub features: FeatureFlags,
}

/// Server of record endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the REST backend, without trailing slash
    pub base_url: String,

    /// Push channel URL; derived from `base_url` when absent
    pub push_url: Option<String>,

    /// Timeout applied to every REST request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl ServerConfig {
    /// The push channel URL, derived as `ws(s)://<host>/ws` when not set
    pub fn push_url(&self) -> String {
        if let Some(url) = &self.push_url {
            return url.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/ws", ws_base)
    }
}

/// Resilient connection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// First reconnect interval
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Ceiling for the reconnect interval
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Growth factor applied to the interval after each scheduled reconnect
    pub backoff_multiplier: f64,

    /// Upper bound of the additive jitter
    #[serde(with = "humantime_serde")]
    pub max_jitter: Duration,

    /// Reconnect attempts before the connection closes permanently
    pub max_attempts: u32,

    /// How often liveness is checked
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which a ping is sent
    #[serde(with = "humantime_serde")]
    pub ping_after: Duration,

    /// Silence after which the connection is treated as dead
    #[serde(with = "humantime_serde")]
    pub dead_after: Duration,

    /// Handshake timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Group state store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for persisted snapshots
    pub data_dir: PathBuf,

    /// Age of the last resync beyond which rehydration forces a resync
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    /// Resyncs closer together than this are logged as rapid
    #[serde(with = "humantime_serde")]
    pub min_resync_interval: Duration,

    /// Per-group roster fetch timeout
    #[serde(with = "humantime_serde")]
    pub roster_timeout: Duration,

    /// Attempts for retriable backend reads
    pub fetch_attempts: u32,

    /// Pause before the first retry; doubles on each further retry
    #[serde(with = "humantime_serde")]
    pub fetch_retry_delay: Duration,
}

/// Orchestrator timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Window used to coalesce bursts of push notifications
    #[serde(with = "humantime_serde")]
    pub push_debounce: Duration,

    /// Pull interval when push channels are unavailable
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Unconditional resync interval
    #[serde(with = "humantime_serde")]
    pub safety_net_interval: Duration,

    /// How long `stop()` waits for background loops
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            push_url: None,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 1.5,
            max_jitter: Duration::from_secs(1),
            max_attempts: 10,
            heartbeat_interval: Duration::from_secs(15),
            ping_after: Duration::from_secs(30),
            dead_after: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            stale_after: Duration::from_secs(2 * 60 * 60),
            min_resync_interval: Duration::from_secs(2),
            roster_timeout: Duration::from_secs(5),
            fetch_attempts: 3,
            fetch_retry_delay: Duration::from_millis(500),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_debounce: Duration::from_millis(500),
            poll_interval: Duration::from_secs(10),
            safety_net_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn parse_env<T>(key: &str, what: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(ConfigError::InvalidEnv { var: key.to_string(), what: what.to_string(), value: raw }),
        },
        Err(_) => Ok(None),
    }
}

fn parse_env_duration(key: &str, what: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => match humantime_serde::re::humantime::parse_duration(&raw) {
            Ok(d) => Ok(Some(d)),
            Err(_) => Err(ConfigError::InvalidEnv { var: key.to_string(), what: what.to_string(), value: raw }),
        },
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Environment variables follow the pattern: FITSYNC_<SECTION>_<KEY>
    /// Example: FITSYNC_SERVER_BASE_URL=https://api.example.com
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FITSYNC_*` overrides in place
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("FITSYNC_SERVER_BASE_URL") {
            self.server.base_url = url;
        }
        if let Ok(url) = env::var("FITSYNC_SERVER_PUSH_URL") {
            self.server.push_url = Some(url);
        }
        if let Some(d) = parse_env_duration("FITSYNC_SERVER_REQUEST_TIMEOUT", "request timeout")? {
            self.server.request_timeout = d;
        }

        if let Some(n) = parse_env("FITSYNC_CONNECTION_MAX_ATTEMPTS", "max attempts")? {
            self.connection.max_attempts = n;
        }
        if let Some(d) = parse_env_duration("FITSYNC_CONNECTION_MAX_BACKOFF", "max backoff")? {
            self.connection.max_backoff = d;
        }

        if let Ok(dir) = env::var("FITSYNC_STORE_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(d) = parse_env_duration("FITSYNC_STORE_STALE_AFTER", "stale threshold")? {
            self.store.stale_after = d;
        }

        if let Some(d) = parse_env_duration("FITSYNC_SYNC_POLL_INTERVAL", "poll interval")? {
            self.sync.poll_interval = d;
        }
        if let Some(push) = parse_env("FITSYNC_FEATURES_PUSH_CHANNELS", "push channel flag")? {
            self.features.push_channels = push;
        }

        if let Ok(level) = env::var("FITSYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_env("FITSYNC_LOG_JSON", "JSON flag")? {
            self.logging.json_format = json;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = &self.server.base_url;
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl { field: "server.base_url", value: base.clone() });
        }
        if let Some(push) = &self.server.push_url {
            if !(push.starts_with("ws://") || push.starts_with("wss://")) {
                return Err(ConfigError::InvalidUrl { field: "server.push_url", value: push.clone() });
            }
        }

        let conn = &self.connection;
        if conn.initial_backoff.is_zero() || conn.initial_backoff > conn.max_backoff {
            return Err(ConfigError::Invalid(
                "initial_backoff must be non-zero and not exceed max_backoff".to_string(),
            ));
        }
        if conn.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if conn.ping_after >= conn.dead_after {
            return Err(ConfigError::Invalid(
                "ping_after must be shorter than dead_after".to_string(),
            ));
        }
        if conn.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        if self.store.fetch_attempts == 0 {
            return Err(ConfigError::Invalid(
                "fetch_attempts must be greater than 0".to_string(),
            ));
        }

        if self.sync.poll_interval.is_zero() || self.sync.safety_net_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sync intervals must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })?;

        Ok(())
    }
}
