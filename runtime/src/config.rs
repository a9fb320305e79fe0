//! Outbox and poller configuration.
//!
//! Configuration is a plain value handed to the components that need it; nothing
//! reads it from a global.
//!
//! # Sources
//!
//! - [`OutboxConfig::default`]
//! - [`OutboxConfig::from_toml_str`]
//! - [`OutboxConfig::from_env`] (`OUTBOX_*` variables)
//!
//! # Example
//!
//! ```
//! use replay_outbox_runtime::config::OutboxConfig;
//!
//! let config = OutboxConfig::from_toml_str(
//!     r#"
//!     [read]
//!     batch_size = 100
//!
//!     [logging]
//!     masked_params = ["iban", "cardNumber"]
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.read.batch_size, 100);
//! assert_eq!(config.send.procedure_name, "send_to_mq");
//! ```

pub use replay_outbox_core::ports::is_valid_procedure_name;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    /// Environment variable holds an unusable value
    #[error("Invalid value for {var}: {value}")]
    InvalidEnvVar {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },
}

/// Send path configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// Stored function receiving one envelope JSON
    pub procedure_name: String,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            procedure_name: "send_to_mq".to_string(),
        }
    }
}

/// Poller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Stored function returning a batch of envelopes
    pub procedure_name: String,
    /// Maximum envelopes per poll cycle
    pub batch_size: u32,
    /// Delay between the end of one poll cycle and the start of the next
    pub fixed_delay_ms: u64,
}

impl ReadConfig {
    /// Delay between poll cycles as a `Duration`
    #[must_use]
    pub const fn fixed_delay(&self) -> Duration {
        Duration::from_millis(self.fixed_delay_ms)
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            procedure_name: "read_from_mq".to_string(),
            batch_size: 50,
            fixed_delay_ms: 2000,
        }
    }
}

/// Envelope defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Version tag used when the caller gives none
    pub default_version: String,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            default_version: replay_outbox_core::DEFAULT_VERSION.to_string(),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Param keys whose values are replaced by `***` in logs
    pub masked_params: Vec<String>,
}

/// Complete outbox configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Send path
    pub send: SendConfig,
    /// Poller
    pub read: ReadConfig,
    /// Envelope defaults
    pub envelope: EnvelopeConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl OutboxConfig {
    /// Parse and validate a TOML document; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Validation`] for invalid values.
    pub fn from_toml_str(toml_text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `OUTBOX_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OUTBOX_SEND_PROCEDURE` | `send.procedure_name` |
    /// | `OUTBOX_READ_PROCEDURE` | `read.procedure_name` |
    /// | `OUTBOX_READ_BATCH_SIZE` | `read.batch_size` |
    /// | `OUTBOX_READ_FIXED_DELAY_MS` | `read.fixed_delay_ms` |
    /// | `OUTBOX_DEFAULT_VERSION` | `envelope.default_version` |
    /// | `OUTBOX_MASKED_PARAMS` | `logging.masked_params` (comma separated) |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnvVar`] for unparsable numbers and
    /// [`ConfigError::Validation`] for invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("OUTBOX_SEND_PROCEDURE") {
            config.send.procedure_name = value;
        }
        if let Some(value) = lookup("OUTBOX_READ_PROCEDURE") {
            config.read.procedure_name = value;
        }
        if let Some(value) = lookup("OUTBOX_READ_BATCH_SIZE") {
            config.read.batch_size = parse_var("OUTBOX_READ_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("OUTBOX_READ_FIXED_DELAY_MS") {
            config.read.fixed_delay_ms = parse_var("OUTBOX_READ_FIXED_DELAY_MS", &value)?;
        }
        if let Some(value) = lookup("OUTBOX_DEFAULT_VERSION") {
            config.envelope.default_version = value;
        }
        if let Some(value) = lookup("OUTBOX_MASKED_PARAMS") {
            config.logging.masked_params = value
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate all sections.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_procedure_name("send.procedure_name", &self.send.procedure_name)?;
        validate_procedure_name("read.procedure_name", &self.read.procedure_name)?;
        if self.read.batch_size == 0 {
            return Err(ConfigError::Validation("read.batch_size must be > 0".to_string()));
        }
        if self.read.fixed_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "read.fixed_delay_ms must be > 0".to_string(),
            ));
        }
        if self.envelope.default_version.trim().is_empty() {
            return Err(ConfigError::Validation(
                "envelope.default_version cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvVar {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn validate_procedure_name(field: &str, name: &str) -> Result<(), ConfigError> {
    if is_valid_procedure_name(name) {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{field} must be a plain SQL identifier, got {name:?}"
        )))
    }
}
