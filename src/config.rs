//! Configuration module for the telemetry relay pipeline.
//!
//! This module provides environment-based configuration for the pipeline,
//! including collector URL, storage location, batching, and retry settings.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default base URL for the collector backend
const DEFAULT_BACKEND_URL: &str = "http://localhost:3000";

/// Default pending-queue depth that triggers an immediate flush
const DEFAULT_BATCH_SIZE: usize = 50;

/// Default flush interval in seconds
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

/// Default cap on locally retained event history
const DEFAULT_MAX_LOCAL_EVENTS: usize = 1_000;

/// Default delay before retrying a failed delivery, in milliseconds
const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Maximum allowed local history cap
const MAX_LOCAL_EVENTS_LIMIT: usize = 100_000;

/// Minimum flush interval to prevent overwhelming the collector
const MIN_FLUSH_INTERVAL_SECS: u64 = 1;

/// Maximum flush interval to ensure reasonable data freshness
const MAX_FLUSH_INTERVAL_SECS: u64 = 300;

/// Minimum retry delay to avoid hammering a failing collector
const MIN_RETRY_DELAY_MS: u64 = 100;

/// Maximum retry delay to keep the queue from going stale
const MAX_RETRY_DELAY_MS: u64 = 600_000;

/// Configuration for the telemetry relay pipeline.
///
/// All settings can be configured via environment variables:
/// - `TELEMETRY_RELAY_ENABLED`: Master switch (default: true)
/// - `TELEMETRY_RELAY_BACKEND_URL`: Collector base URL (default: http://localhost:3000)
/// - `TELEMETRY_RELAY_STORAGE_PATH`: Buffer document path (default: platform data dir)
/// - `TELEMETRY_RELAY_BATCH_SIZE`: Pending events per flush trigger (default: 50)
/// - `TELEMETRY_RELAY_FLUSH_INTERVAL_SECS`: Seconds between scheduled flushes (default: 30)
/// - `TELEMETRY_RELAY_MAX_LOCAL_EVENTS`: Local history cap (default: 1000)
/// - `TELEMETRY_RELAY_RETRY_DELAY_MS`: Delay before retrying a failed flush (default: 5000)
/// - `TELEMETRY_RELAY_MAX_RETRIES`: Retry budget reported at startup (default: 3)
/// - `TELEMETRY_RELAY_REQUEST_TIMEOUT_SECS`: Per-request timeout (default: 30)
/// - `TELEMETRY_RELAY_DEBUG`: Log internal failures (default: false)
/// - `TELEMETRY_RELAY_DASHBOARD`: Periodic stats dashboard in the demo binary (default: false)
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch. When false the pipeline records nothing and never
    /// touches storage or the network.
    pub enabled: bool,

    /// Base URL for the collector backend
    pub backend_url: String,

    /// Full URL for the analytics ingest endpoint
    pub events_url: String,

    /// Path of the durable buffer document on disk
    pub storage_path: PathBuf,

    /// Cap on locally retained event history; oldest entries drop first
    pub max_local_events: usize,

    /// Number of pending events that triggers an immediate flush
    pub batch_size: usize,

    /// Duration between scheduled background flushes
    pub flush_interval: Duration,

    /// Delay before a failed delivery is retried
    pub retry_delay: Duration,

    /// Retry budget recognized from the environment and reported at startup.
    /// Failed deliveries are currently rescheduled until the queue drains.
    pub max_retries: u32,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// When true, internal failures are logged instead of silently swallowed
    pub debug_mode: bool,

    /// When true, the demo binary prints a periodic stats dashboard
    pub enable_dashboard: bool,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Returns a new `Config` instance with values from environment variables,
    /// falling back to sensible defaults where appropriate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `TELEMETRY_RELAY_BATCH_SIZE` is not a valid number or exceeds limits
    /// - `TELEMETRY_RELAY_FLUSH_INTERVAL_SECS` is not a valid number or exceeds limits
    /// - `TELEMETRY_RELAY_MAX_LOCAL_EVENTS` is not a valid number or exceeds limits
    /// - `TELEMETRY_RELAY_RETRY_DELAY_MS` is not a valid number or exceeds limits
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_relay::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Collector URL: {}", config.events_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load and normalize the backend URL
        let backend_url = env::var("TELEMETRY_RELAY_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        let backend_url = backend_url.trim_end_matches('/').to_string();

        // Construct full ingest endpoint URL
        let events_url = format!("{}/api/analytics/events", backend_url);

        // Load the buffer document path
        let storage_path = env::var("TELEMETRY_RELAY_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_storage_path());

        // Load and parse the validated numeric settings
        let batch_size = Self::parse_batch_size()?;
        let flush_interval = Duration::from_secs(Self::parse_flush_interval()?);
        let max_local_events = Self::parse_max_local_events()?;
        let retry_delay = Duration::from_millis(Self::parse_retry_delay()?);

        // Load request timeout (optional, defaults to 30 seconds)
        let request_timeout_secs: u64 = env::var("TELEMETRY_RELAY_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let request_timeout = Duration::from_secs(request_timeout_secs);

        // Load max retries (optional, defaults to 3)
        let max_retries: u32 = env::var("TELEMETRY_RELAY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        Ok(Self {
            enabled: Self::parse_flag("TELEMETRY_RELAY_ENABLED", true),
            backend_url,
            events_url,
            storage_path,
            max_local_events,
            batch_size,
            flush_interval,
            retry_delay,
            max_retries,
            request_timeout,
            debug_mode: Self::parse_flag("TELEMETRY_RELAY_DEBUG", false),
            enable_dashboard: Self::parse_flag("TELEMETRY_RELAY_DASHBOARD", false),
        })
    }

    /// Parse a boolean flag from an environment variable.
    ///
    /// Accepts `1`/`true`/`yes` and `0`/`false`/`no` (case-insensitive);
    /// anything else falls back to the default.
    fn parse_flag(env_var: &str, default: bool) -> bool {
        match env::var(env_var) {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => default,
            },
            Err(_) => default,
        }
    }

    /// Parse batch size from environment variable with validation.
    fn parse_batch_size() -> Result<usize, ConfigError> {
        let env_var = "TELEMETRY_RELAY_BATCH_SIZE";

        match env::var(env_var) {
            Ok(value) => {
                let batch_size: usize = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if batch_size == 0 {
                    return Err(ConfigError {
                        message: "batch size must be greater than 0".to_string(),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if batch_size > MAX_BATCH_SIZE {
                    return Err(ConfigError {
                        message: format!(
                            "batch size {} exceeds maximum allowed ({})",
                            batch_size, MAX_BATCH_SIZE
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(batch_size)
            }
            Err(_) => Ok(DEFAULT_BATCH_SIZE),
        }
    }

    /// Parse the local history cap from environment variable with validation.
    fn parse_max_local_events() -> Result<usize, ConfigError> {
        let env_var = "TELEMETRY_RELAY_MAX_LOCAL_EVENTS";

        match env::var(env_var) {
            Ok(value) => {
                let cap: usize = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if cap == 0 {
                    return Err(ConfigError {
                        message: "local event cap must be greater than 0".to_string(),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if cap > MAX_LOCAL_EVENTS_LIMIT {
                    return Err(ConfigError {
                        message: format!(
                            "local event cap {} exceeds maximum allowed ({})",
                            cap, MAX_LOCAL_EVENTS_LIMIT
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(cap)
            }
            Err(_) => Ok(DEFAULT_MAX_LOCAL_EVENTS),
        }
    }

    /// Parse flush interval from environment variable with validation.
    fn parse_flush_interval() -> Result<u64, ConfigError> {
        let env_var = "TELEMETRY_RELAY_FLUSH_INTERVAL_SECS";

        match env::var(env_var) {
            Ok(value) => {
                let interval: u64 = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if interval < MIN_FLUSH_INTERVAL_SECS {
                    return Err(ConfigError {
                        message: format!(
                            "flush interval {} is below minimum ({}s)",
                            interval, MIN_FLUSH_INTERVAL_SECS
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if interval > MAX_FLUSH_INTERVAL_SECS {
                    return Err(ConfigError {
                        message: format!(
                            "flush interval {} exceeds maximum ({}s)",
                            interval, MAX_FLUSH_INTERVAL_SECS
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(interval)
            }
            Err(_) => Ok(DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }

    /// Parse retry delay from environment variable with validation.
    fn parse_retry_delay() -> Result<u64, ConfigError> {
        let env_var = "TELEMETRY_RELAY_RETRY_DELAY_MS";

        match env::var(env_var) {
            Ok(value) => {
                let delay: u64 = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if delay < MIN_RETRY_DELAY_MS {
                    return Err(ConfigError {
                        message: format!(
                            "retry delay {} is below minimum ({}ms)",
                            delay, MIN_RETRY_DELAY_MS
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if delay > MAX_RETRY_DELAY_MS {
                    return Err(ConfigError {
                        message: format!(
                            "retry delay {} exceeds maximum ({}ms)",
                            delay, MAX_RETRY_DELAY_MS
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(delay)
            }
            Err(_) => Ok(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            enabled: true,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            events_url: format!("{}/api/analytics/events", DEFAULT_BACKEND_URL),
            storage_path: default_storage_path(),
            max_local_events: DEFAULT_MAX_LOCAL_EVENTS,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            debug_mode: false,
            enable_dashboard: false,
        }
    }
}

/// Platform-appropriate default location of the buffer document.
fn default_storage_path() -> PathBuf {
    data_dir().join("events.json")
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = env::var("APPDATA") {
            return PathBuf::from(appdata).join("telemetry-relay");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/telemetry-relay");
        }
    }

    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".local/share/telemetry-relay");
    }

    PathBuf::from(".telemetry-relay")
}
