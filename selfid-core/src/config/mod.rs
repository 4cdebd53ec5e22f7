//! Client configuration
//!
//! Defaults match the relay's expectations; every field can be overridden
//! from a TOML file or from `SELFID_*` environment variables. Durations are
//! written in humantime form (`"60s"`, `"2m"`).

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::core_proto::DEFAULT_MAX_FRAME_SIZE;
use crate::logging::{LogConfig, LogLevel};

mod error;

pub use error::ConfigError;

/// Public messaging endpoint
pub const DEFAULT_URL: &str = "wss://messaging.selfid.net/v1/messaging";

/// Device id used when the app registers a single device
pub const DEFAULT_DEVICE_ID: &str = "1";

/// Messaging client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay endpoint
    pub url: String,

    /// This app's device id
    pub device_id: String,

    /// Reconnect after the link drops instead of closing for good
    pub auto_reconnect: bool,

    /// How long to wait for the relay to acknowledge a frame
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// How long to wait for a correlated response
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,

    /// Pause between a lost link and the next connection attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// How often expired waits are released
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Keepalive ping period
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Inbound frames larger than this are dropped
    pub max_frame_size: usize,

    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
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

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            device_id: DEFAULT_DEVICE_ID.to_string(),
            auto_reconnect: true,
            ack_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(120),
            reconnect_delay: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            logging: LoggingConfig::default(),
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

impl LoggingConfig {
    pub fn to_log_config(&self) -> Result<LogConfig, ConfigError> {
        let level = LogLevel::from_str(&self.level).map_err(|_| ConfigError::InvalidValue {
            key: "logging.level",
            reason: format!("unknown level {:?}", self.level),
        })?;

        Ok(LogConfig::new(level)
            .with_timestamp(self.with_timestamp)
            .with_target(self.with_target)
            .json_format(self.json_format))
    }
}

impl ClientConfig {
    /// Defaults with a different relay endpoint
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Variables follow the pattern SELFID_<KEY>, for example
    /// `SELFID_MESSAGING_URL=wss://...` or `SELFID_ACK_TIMEOUT=30s`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SELFID_MESSAGING_URL") {
            config.url = url;
        }
        if let Some(device_id) = lookup("SELFID_DEVICE_ID") {
            config.device_id = device_id;
        }
        if let Some(value) = lookup("SELFID_AUTO_RECONNECT") {
            config.auto_reconnect = parse_value("SELFID_AUTO_RECONNECT", &value)?;
        }

        let durations: [(&'static str, &mut Duration); 5] = [
            ("SELFID_ACK_TIMEOUT", &mut config.ack_timeout),
            ("SELFID_RESPONSE_TIMEOUT", &mut config.response_timeout),
            ("SELFID_RECONNECT_DELAY", &mut config.reconnect_delay),
            ("SELFID_SWEEP_INTERVAL", &mut config.sweep_interval),
            ("SELFID_PING_INTERVAL", &mut config.ping_interval),
        ];
        for (key, slot) in durations {
            if let Some(value) = lookup(key) {
                *slot = humantime_serde::re::humantime::parse_duration(&value).map_err(|e| {
                    ConfigError::InvalidValue {
                        key,
                        reason: e.to_string(),
                    }
                })?;
            }
        }

        if let Some(value) = lookup("SELFID_MAX_FRAME_SIZE") {
            config.max_frame_size = parse_value("SELFID_MAX_FRAME_SIZE", &value)?;
        }

        // Logging config
        if let Some(level) = lookup("SELFID_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(value) = lookup("SELFID_LOG_JSON") {
            config.logging.json_format = parse_value("SELFID_LOG_JSON", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed("url must not be empty".to_string()));
        }

        if self.device_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "device_id must not be empty".to_string(),
            ));
        }

        let periods = [
            ("ack_timeout", self.ack_timeout),
            ("response_timeout", self.response_timeout),
            ("sweep_interval", self.sweep_interval),
            ("ping_interval", self.ping_interval),
        ];
        for (name, value) in periods {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_frame_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_frame_size must be greater than 0".to_string(),
            ));
        }

        self.logging.to_log_config()?;
        Ok(())
    }
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device_id, "1");
        assert!(config.auto_reconnect);
        assert_eq!(config.ack_timeout, Duration::from_secs(60));
        assert_eq!(config.response_timeout, Duration::from_secs(120));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::default();
        config.url = " ".to_string();
        assert!(config.validate().is_err());

        config = ClientConfig::default();
        config.device_id = String::new();
        assert!(config.validate().is_err());

        config = ClientConfig::default();
        config.ack_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = ClientConfig::default();
        config.max_frame_size = 0;
        assert!(config.validate().is_err());

        // A zero reconnect delay is allowed
        config = ClientConfig::default();
        config.reconnect_delay = Duration::ZERO;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = ClientConfig::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = ClientConfig::from_vars(vars(&[
            ("SELFID_MESSAGING_URL", "ws://localhost:8086/v1/messaging"),
            ("SELFID_DEVICE_ID", "7"),
            ("SELFID_AUTO_RECONNECT", "false"),
            ("SELFID_ACK_TIMEOUT", "5s"),
            ("SELFID_RESPONSE_TIMEOUT", "2m"),
            ("SELFID_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.url, "ws://localhost:8086/v1/messaging");
        assert_eq!(config.device_id, "7");
        assert!(!config.auto_reconnect);
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.response_timeout, Duration::from_secs(120));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_vars_rejects_bad_values() {
        let err = ClientConfig::from_vars(vars(&[("SELFID_ACK_TIMEOUT", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "SELFID_ACK_TIMEOUT", .. }));

        let err = ClientConfig::from_vars(vars(&[("SELFID_AUTO_RECONNECT", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "SELFID_AUTO_RECONNECT", .. }));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selfid.toml");

        let mut config = ClientConfig::with_url("ws://127.0.0.1:9000");
        config.ping_interval = Duration::from_secs(5);
        config.save_to_file(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("ping_interval = \"5s\""));

        assert_eq!(ClientConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "device_id = \"2\"\nack_timeout = \"10s\"\n").unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.device_id, "2");
        assert_eq!(config.ack_timeout, Duration::from_secs(10));
        assert_eq!(config.url, DEFAULT_URL);
    }

    #[test]
    fn test_missing_file() {
        let err = ClientConfig::from_file("/nonexistent/selfid.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }
}
