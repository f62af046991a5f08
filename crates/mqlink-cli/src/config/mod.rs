//! Runner configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `mqlink.toml`)
//! - Environment variables with `MQLINK__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `MQLINK__BROKER__HOST=broker.local`
//! - `MQLINK__BROKER__PORT=8883`
//! - `MQLINK__SESSION__OPERATION_TIMEOUT_MS=1000`
//!
//! In-file substitution examples:
//! ```toml
//! [broker]
//! host = "${MQTT_HOST:-localhost}"
//! password = "${MQTT_PASSWORD}"
//! ```

mod broker;
mod log;
mod session;
mod steps;

use std::path::Path;

use config::{Environment, File, FileFormat};
use mqlink_client::ConnectOptions;
use regex::Regex;
use serde::Deserialize;

pub use broker::{BrokerConfig, WillConfig, DEFAULT_CONNECT_TIMEOUT_MS};
pub use log::LogConfig;
pub use session::{SessionConfig, DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_STOP_TIMEOUT_MS};
pub use steps::{StepAction, StepConfig};

const ENV_PATTERN: &str = r"\$\{([^}:]+)(?::-([^}]*))?\}";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(ENV_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub broker: BrokerConfig,
    /// Optional last will.
    pub will: Option<WillConfig>,
    pub session: SessionConfig,
    /// Steps run in order after connecting.
    pub steps: Vec<StepConfig>,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and `MQLINK__` variables
    /// still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.host", "localhost")?
            .set_default("broker.clean_session", true)?
            .set_default(
                "broker.keep_alive",
                mqlink_client::DEFAULT_KEEP_ALIVE as i64,
            )?
            .set_default("broker.connect_timeout_ms", DEFAULT_CONNECT_TIMEOUT_MS as i64)?
            .set_default("session.stop_timeout_ms", DEFAULT_STOP_TIMEOUT_MS as i64)?
            .set_default("session.operation_timeout_ms", DEFAULT_OPERATION_TIMEOUT_MS as i64)?;

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (for testing).
    #[allow(dead_code)]
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content)?;
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connect_options()?;
        self.session.validate().map_err(ConfigError::Validation)?;
        for (i, step) in self.steps.iter().enumerate() {
            step.validate()
                .map_err(|e| ConfigError::Validation(format!("steps[{}]: {}", i, e)))?;
        }
        Ok(())
    }

    /// Connect options for the configured broker and will.
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        self.broker
            .to_options(self.will.as_ref())
            .map_err(ConfigError::Validation)
    }
}
