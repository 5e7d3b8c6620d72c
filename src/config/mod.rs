//! Application configuration.
//!
//! Aggregates configuration from all components into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use messaging::{BrokerConfig, OutboxConfig, RouteConfig, RouteType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Saga orchestration configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Per-step timeout. A step exceeding it counts as failed. Default: none.
    pub step_timeout_ms: Option<u64>,
}

impl SagaConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub outbox: OutboxConfig,
    pub saga: SagaConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `config.yaml` in the current directory, if present
    /// 2. the file at `path`, if given
    /// 3. the file named by `COURIER_CONFIG`, if set
    /// 4. `COURIER__<SECTION>__<KEY>` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: millisecond retry and poll intervals.
    pub fn for_test() -> Self {
        Self {
            broker: BrokerConfig {
                retry_base_delay_ms: 5,
                retry_max_delay_ms: 50,
                receive_timeout_ms: 100,
                ..BrokerConfig::default()
            },
            outbox: OutboxConfig {
                poll_interval_ms: 20,
                ..OutboxConfig::default()
            },
            saga: SagaConfig::default(),
        }
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
