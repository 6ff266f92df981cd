//! Application configuration.
//!
//! Aggregates bus and transport configuration into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod bus;
mod messaging;

pub use bus::BusConfig;
pub use messaging::{TransportConfig, TransportType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTBUS_LOG";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bus behaviour: service identity, retries, concurrency.
    pub bus: BusConfig,
    /// Broker selection and broker-specific settings.
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("bus.service_name must not be empty".to_string()));
        }
        if self.bus.batch_size == 0 {
            return Err(ConfigError::Invalid("bus.batch_size must be at least 1".to_string()));
        }
        if self.bus.concurrency == 0 {
            return Err(ConfigError::Invalid("bus.concurrency must be at least 1".to_string()));
        }
        if self.bus.publish_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "bus.publish_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.bus.retry_base_delay_ms = 0;
        config.transport.wait_time_secs = 1;
        config
    }
}
