//! Configuration loading using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. A TOML file
//! 3. Environment variables prefixed with `SENSORBRIDGE_`
//!
//! Nested keys are separated by a double underscore in environment variables:
//!
//! ```text
//! SENSORBRIDGE_DEVICE_TYPE=golink
//! SENSORBRIDGE_LOG_LEVEL=debug
//! SENSORBRIDGE_SESSION__MAX_CONSECUTIVE_ERRORS=10
//! ```
//!
//! A minimal file:
//!
//! ```toml
//! device_type = "manual"
//!
//! [session]
//! initial_delay_ms = 20
//!
//! [parameters]
//! deviceId = "31"
//! openString = "COM3"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionOptions;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/sensor_bridge.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// The merged configuration is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Logical device type (golink, goio, labquest, manual, pseudo)
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Session timing and limits
    #[serde(default)]
    pub session: SessionSettings,
    /// Host parameters handed to device resolution
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Session timing and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Bound on draining the session worker at destroy
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Delay before the first sampling tick
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Consecutive read faults that stop sampling
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Scalar slots in the read buffer
    #[serde(default = "default_read_buffer_len")]
    pub read_buffer_len: usize,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_device_type() -> String {
    "pseudo".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_initial_delay() -> u64 {
    10
}

fn default_max_consecutive_errors() -> u32 {
    crate::session::sampler::DEFAULT_MAX_CONSECUTIVE_ERRORS
}

fn default_read_buffer_len() -> usize {
    crate::session::sampler::DEFAULT_READ_BUFFER_LEN
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_type: default_device_type(),
            log_level: default_log_level(),
            session: SessionSettings::default(),
            parameters: BTreeMap::new(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout(),
            initial_delay_ms: default_initial_delay(),
            max_consecutive_errors: default_max_consecutive_errors(),
            read_buffer_len: default_read_buffer_len(),
        }
    }
}

impl SessionSettings {
    /// Convert to the controller's runtime options.
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_consecutive_errors: self.max_consecutive_errors,
            read_buffer_len: self.read_buffer_len,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl BridgeConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(BridgeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SENSORBRIDGE_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Device type is not blank
    /// - Error threshold and read buffer are at least 1
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.device_type.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "device_type cannot be empty".to_string(),
            ));
        }

        if self.session.max_consecutive_errors == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_consecutive_errors must be at least 1".to_string(),
            ));
        }

        if self.session.read_buffer_len == 0 {
            return Err(ConfigError::ValidationError(
                "session.read_buffer_len must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = BridgeConfig::load_from("/nonexistent/sensor_bridge.toml").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.session.options().initial_delay, Duration::from_millis(10));
    }

    #[test]
    #[serial]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
            device_type = "manual"

            [session]
            max_consecutive_errors = 3

            [parameters]
            deviceId = "31"
            "#,
        );

        let config = BridgeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.device_type, "manual");
        assert_eq!(config.session.max_consecutive_errors, 3);
        assert_eq!(config.session.read_buffer_len, 1024);
        assert_eq!(config.parameters.get("deviceId").map(String::as_str), Some("31"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("log_level = \"warn\"\n");
        std::env::set_var("SENSORBRIDGE_LOG_LEVEL", "debug");
        std::env::set_var("SENSORBRIDGE_SESSION__INITIAL_DELAY_MS", "25");

        let result = BridgeConfig::load_from(file.path());
        std::env::remove_var("SENSORBRIDGE_LOG_LEVEL");
        std::env::remove_var("SENSORBRIDGE_SESSION__INITIAL_DELAY_MS");

        let config = result.unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.session.initial_delay_ms, 25);
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_load_error() {
        let file = write_config("device_type = [");
        assert!(matches!(
            BridgeConfig::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let config = BridgeConfig {
            log_level: "chatty".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = BridgeConfig::default();
        config.session.max_consecutive_errors = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
