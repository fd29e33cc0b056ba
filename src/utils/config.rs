//! Configuration management for the ratchet messenger.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "messenger.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESSENGER";

/// Application directory name under the platform data/config dirs
const APP_DIR: &str = "ratchet-messenger";

/// Complete configuration for the messenger application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Relay connection
    pub signaling: SignalingConfig,
    /// Ratchet parameters
    pub crypto: CryptoConfig,
    /// File stream throttling
    pub transfer: TransferConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Relay connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// `host:port` of the signaling relay
    pub relay_address: String,
}

/// Ratchet configuration shared by both peers of a chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Messages sent on one chain before a forced DH ratchet step
    pub ratchet_threshold: u32,
}

/// File stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes written to a data channel per period
    pub chunk_size: usize,
    /// Throttle period in milliseconds
    pub period_ms: u64,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for the identity key and contacts
    pub keys_dir: PathBuf,
    /// Directory received files are written into
    pub media_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

/// Value of `MESSENGER_<name>`, if set
fn env_override(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_address: crate::defaults::DEFAULT_RELAY_ADDRESS.to_string(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            ratchet_threshold: crate::defaults::DEFAULT_RATCHET_THRESHOLD,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::defaults::MESSAGE_CHUNK_SIZE,
            period_ms: crate::defaults::MESSAGE_STREAM_PERIOD_MS,
        }
    }
}

impl TransferConfig {
    /// Throttle period as a [`Duration`]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            keys_dir: data_dir.join("keys"),
            media_dir: data_dir.join("media"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// # Arguments
    ///
    /// * `config_file` - Optional path to configuration file
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = config.merge(Self::from_file(path)?);
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_DIR)
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = config.merge(Self::from_file(location)?);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        self.signaling = other.signaling;
        self.crypto = other.crypto;
        self.transfer = other.transfer;
        self.storage = other.storage;
        self.logging = other.logging;
        self
    }

    fn merge_from_env(mut self) -> Result<Self> {
        if let Some(address) = env_override("SIGNALING_RELAY_ADDRESS") {
            self.signaling.relay_address = address;
        }

        if let Some(threshold) = env_override("CRYPTO_RATCHET_THRESHOLD") {
            self.crypto.ratchet_threshold =
                threshold.parse().map_err(|_| ConfigError::InvalidValue {
                    field: format!("{ENV_PREFIX}_CRYPTO_RATCHET_THRESHOLD"),
                    value: threshold,
                })?;
        }

        if let Some(level) = env_override("LOGGING_LEVEL") {
            self.logging.level = level;
        }

        if let Some(data_dir) = env_override("STORAGE_DATA_DIR") {
            let data_dir = PathBuf::from(data_dir);
            self.storage.keys_dir = data_dir.join("keys");
            self.storage.media_dir = data_dir.join("media");
            self.storage.data_dir = data_dir;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let address = &self.signaling.relay_address;
        let port_ok = address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().map_or(false, |p| p != 0))
            .unwrap_or(false);
        if !port_ok {
            return Err(ConfigError::InvalidValue {
                field: "signaling.relay_address".to_string(),
                value: address.clone(),
            }
            .into());
        }

        if self.crypto.ratchet_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "crypto.ratchet_threshold".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transfer.chunk_size".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.transfer.period_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transfer.period_ms".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: self.logging.level.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs_to_create = [
            &self.storage.data_dir,
            &self.storage.keys_dir,
            &self.storage.media_dir,
        ];

        for dir in &dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
