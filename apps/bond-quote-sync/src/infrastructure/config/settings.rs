//! Sync Configuration Settings
//!
//! Configuration types for the quote sync service, loaded from environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::ports::Credentials;
use crate::application::services::EngineConfig;
use crate::infrastructure::deepmm::{
    DEFAULT_STREAM_URL, DEFAULT_TOKEN_REFRESH, HeartbeatConfig, ReconnectConfig,
    StreamClientConfig,
};

/// Default location of the persisted worksheet configuration.
pub const DEFAULT_CONFIG_PATH: &str = "quote-sync-config.json";

/// Stream connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Market-data WebSocket URL.
    pub url: String,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence tolerated after a ping before the connection is dropped.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Consecutive failures before a persistent-failure notice.
    pub reconnect_notify_after: u32,
    /// Consecutive protocol errors tolerated before reconnecting.
    pub max_protocol_errors: u32,
    /// Period between token refreshes on a live connection.
    pub token_refresh: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(40),
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 2.0,
            reconnect_notify_after: 5,
            max_protocol_errors: 10,
            token_refresh: DEFAULT_TOKEN_REFRESH,
        }
    }
}

impl StreamSettings {
    /// Connection task configuration for these settings.
    #[must_use]
    pub fn client_config(&self) -> StreamClientConfig {
        StreamClientConfig {
            url: self.url.clone(),
            reconnect: ReconnectConfig {
                initial_delay: self.reconnect_delay_initial,
                max_delay: self.reconnect_delay_max,
                multiplier: self.reconnect_delay_multiplier,
                notify_after: self.reconnect_notify_after,
                ..ReconnectConfig::default()
            },
            heartbeat: HeartbeatConfig {
                ping_interval: self.heartbeat_interval,
                timeout: self.heartbeat_timeout,
            },
            max_protocol_errors: self.max_protocol_errors,
            token_refresh: self.token_refresh,
        }
    }
}

/// Engine scheduling settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Quiet period after an edit before a rescan.
    pub edit_debounce: Duration,
    /// Engine tick interval.
    pub tick_interval: Duration,
    /// Stream event queue capacity.
    pub event_queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            edit_debounce: defaults.edit_debounce,
            tick_interval: defaults.tick_interval,
            event_queue_capacity: defaults.event_queue_capacity,
        }
    }
}

impl EngineSettings {
    /// Engine configuration for these settings.
    #[must_use]
    pub const fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            edit_debounce: self.edit_debounce,
            event_queue_capacity: self.event_queue_capacity,
            tick_interval: self.tick_interval,
        }
    }
}

/// File locations.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Persisted worksheet configuration.
    pub config_path: PathBuf,
    /// Workbook snapshot to load.
    pub workbook_path: PathBuf,
    /// Where to write the workbook on shutdown, if anywhere.
    pub workbook_out: Option<PathBuf>,
    /// Optional bond reference directory for CUSIP/ISIN lookup.
    pub figi_directory: Option<PathBuf>,
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Market-data account credentials.
    pub credentials: Credentials,
    /// Stream connection settings.
    pub stream: StreamSettings,
    /// Engine scheduling settings.
    pub engine: EngineSettings,
    /// File locations.
    pub storage: StorageSettings,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required key is missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let email = required(&lookup, "DEEPMM_EMAIL")?;
        let password = required(&lookup, "DEEPMM_PASSWORD")?;
        let workbook_path = required(&lookup, "QUOTE_SYNC_WORKBOOK")?;

        let defaults = StreamSettings::default();
        let stream = StreamSettings {
            url: lookup("QUOTE_SYNC_STREAM_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.url),
            heartbeat_interval: parse_duration_secs(
                &lookup,
                "QUOTE_SYNC_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_duration_secs(
                &lookup,
                "QUOTE_SYNC_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_duration_millis(
                &lookup,
                "QUOTE_SYNC_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_secs(
                &lookup,
                "QUOTE_SYNC_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_or(
                &lookup,
                "QUOTE_SYNC_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            reconnect_notify_after: parse_or(
                &lookup,
                "QUOTE_SYNC_RECONNECT_NOTIFY_AFTER",
                defaults.reconnect_notify_after,
            ),
            max_protocol_errors: parse_or(
                &lookup,
                "QUOTE_SYNC_MAX_PROTOCOL_ERRORS",
                defaults.max_protocol_errors,
            ),
            token_refresh: parse_duration_secs(
                &lookup,
                "QUOTE_SYNC_TOKEN_REFRESH_SECS",
                defaults.token_refresh,
            ),
        };

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            edit_debounce: parse_duration_millis(
                &lookup,
                "QUOTE_SYNC_EDIT_DEBOUNCE_MS",
                defaults.edit_debounce,
            ),
            tick_interval: parse_duration_millis(
                &lookup,
                "QUOTE_SYNC_TICK_MS",
                defaults.tick_interval,
            ),
            event_queue_capacity: parse_or(
                &lookup,
                "QUOTE_SYNC_EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            )
            .max(1),
        };

        let storage = StorageSettings {
            config_path: optional_path(&lookup, "QUOTE_SYNC_CONFIG_PATH")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            workbook_path: PathBuf::from(workbook_path),
            workbook_out: optional_path(&lookup, "QUOTE_SYNC_WORKBOOK_OUT"),
            figi_directory: optional_path(&lookup, "QUOTE_SYNC_FIGI_DIRECTORY"),
        };

        Ok(Self {
            credentials: Credentials::new(email, password),
            stream,
            engine,
            storage,
            metrics_port: parse_or(&lookup, "QUOTE_SYNC_METRICS_PORT", 0),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn optional_path<F>(lookup: &F, key: &str) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
