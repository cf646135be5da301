/*!
 * Configuration management for HomeFlow.
 *
 * This module provides functionality to load, validate, and access the
 * process-wide settings of a HomeFlow controller: logging, link timing and
 * engine limits. Per-device rule configuration lives in the engine crate.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for HomeFlow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Engine and link configuration
    #[serde(default)]
    pub engine: EngineConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Controller name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Path of the device configuration file
    #[serde(default = "default_devices_file")]
    pub devices_file: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

/// Engine and link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How many times a timed-out outbound command is re-queued
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// How long a link waits for a reply before retrying
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Pause after each outbound write
    #[serde(default = "default_inter_send_delay_ms")]
    pub inter_send_delay_ms: u64,

    /// How long a link waits for inbound bytes per loop iteration
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum length of a delegation chain
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,

    /// Lower bound of the randomized sync period
    #[serde(default = "default_sync_min_secs")]
    pub sync_min_secs: u64,

    /// Upper bound of the randomized sync period
    #[serde(default = "default_sync_max_secs")]
    pub sync_max_secs: u64,
}

impl EngineConfig {
    /// Reply timeout as a duration
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Inter-send delay as a duration
    pub fn inter_send_delay(&self) -> Duration {
        Duration::from_millis(self.inter_send_delay_ms)
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lower bound of the sync period
    pub fn sync_min(&self) -> Duration {
        Duration::from_secs(self.sync_min_secs)
    }

    /// Upper bound of the sync period
    pub fn sync_max(&self) -> Duration {
        Duration::from_secs(self.sync_max_secs)
    }

    /// Check that the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.max_delegation_depth == 0 {
            return Err(Error::config("max_delegation_depth must be at least 1"));
        }
        if self.sync_min_secs > self.sync_max_secs {
            return Err(Error::config(format!(
                "sync_min_secs ({}) exceeds sync_max_secs ({})",
                self.sync_min_secs, self.sync_max_secs
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be positive"));
        }
        Ok(())
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
            devices_file: default_devices_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_with_target(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            response_timeout_ms: default_response_timeout_ms(),
            inter_send_delay_ms: default_inter_send_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_delegation_depth: default_max_delegation_depth(),
            sync_min_secs: default_sync_min_secs(),
            sync_max_secs: default_sync_max_secs(),
        }
    }
}

fn default_app_name() -> String {
    "homeflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_devices_file() -> String {
    "./devices.toml".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

fn default_retry_limit() -> u32 {
    5
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_inter_send_delay_ms() -> u64 {
    50
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_delegation_depth() -> usize {
    16
}

fn default_sync_min_secs() -> u64 {
    30 * 60
}

fn default_sync_max_secs() -> u64 {
    60 * 60
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.engine.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.engine.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
