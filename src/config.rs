//! Store configuration loading from file and environment variables.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::utils::RetryConfig;

/// Top-level event store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventStoreConfig {
    /// Capacity of each subscription's live buffer before it overflows.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer_size: usize,

    /// Maximum events fetched per storage read during catch-up.
    #[serde(default = "default_catch_up_batch")]
    pub catch_up_batch_size: usize,

    /// Keep the last known version of each stream in memory.
    #[serde(default = "default_true")]
    pub version_cache_enabled: bool,

    /// Redelivery of one event to a failing subscription handler.
    #[serde(default = "RetrySettings::delivery")]
    pub delivery_retry: RetrySettings,

    /// Catch-up reads retried while storage is unavailable.
    #[serde(default = "RetrySettings::storage")]
    pub storage_retry: RetrySettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Exponential backoff settings as written in a config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "event_store_core=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_subscription_buffer() -> usize {
    1024
}

fn default_catch_up_batch() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info,event_store_core=debug".to_string()
}

impl RetrySettings {
    fn delivery() -> Self {
        RetryConfig::default().into()
    }

    fn storage() -> Self {
        RetryConfig::aggressive().into()
    }
}

impl From<RetryConfig> for RetrySettings {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            multiplier: config.multiplier,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
        }
    }
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            subscription_buffer_size: default_subscription_buffer(),
            catch_up_batch_size: default_catch_up_batch(),
            version_cache_enabled: true,
            delivery_retry: RetrySettings::delivery(),
            storage_retry: RetrySettings::storage(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl EventStoreConfig {
    pub fn delivery_retry(&self) -> RetryConfig {
        (&self.delivery_retry).into()
    }

    pub fn storage_retry(&self) -> RetryConfig {
        (&self.storage_retry).into()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription_buffer_size == 0 {
            return Err(ConfigError::Invalid("subscription_buffer_size must be > 0".to_string()));
        }
        if self.catch_up_batch_size == 0 {
            return Err(ConfigError::Invalid("catch_up_batch_size must be > 0".to_string()));
        }
        for (name, retry) in [("delivery_retry", &self.delivery_retry), ("storage_retry", &self.storage_retry)] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!("{}.max_attempts must be >= 1", name)));
            }
            if retry.multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!("{}.multiplier must be >= 1.0", name)));
            }
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `EVENT_STORE_SUBSCRIPTION_BUFFER` overrides `subscription_buffer_size`
/// - `EVENT_STORE_CATCH_UP_BATCH` overrides `catch_up_batch_size`
/// - `EVENT_STORE_VERSION_CACHE` overrides `version_cache_enabled`
/// - `EVENT_STORE_LOG_LEVEL` overrides `logging.level`
/// - `EVENT_STORE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting configuration does not validate.
pub fn load_config(path: Option<&str>) -> Result<EventStoreConfig, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                EventStoreConfig::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => EventStoreConfig::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

fn apply_overrides(config: &mut EventStoreConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(size) = lookup("EVENT_STORE_SUBSCRIPTION_BUFFER") {
        if let Ok(parsed) = size.parse() {
            config.subscription_buffer_size = parsed;
        }
    }
    if let Some(size) = lookup("EVENT_STORE_CATCH_UP_BATCH") {
        if let Ok(parsed) = size.parse() {
            config.catch_up_batch_size = parsed;
        }
    }
    if let Some(enabled) = lookup("EVENT_STORE_VERSION_CACHE") {
        config.version_cache_enabled = enabled == "true" || enabled == "1";
    }
    if let Some(level) = lookup("EVENT_STORE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("EVENT_STORE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
