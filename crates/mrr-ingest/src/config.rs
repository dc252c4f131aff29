//! Configuration management for mrr-ingest.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "mrr-ingest";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `MRR_INGEST_`)
/// 2. TOML config file at `~/.config/mrr-ingest/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial transport configuration.
    pub transport: TransportConfig,
    /// Raw file storage configuration.
    pub storage: StorageConfig,
    /// External converter configuration.
    pub converter: ConverterConfig,
    /// Upload sink configuration.
    pub upload: UploadConfig,
}

/// Serial transport configuration.
///
/// The line speed, parity, and flow control are instrument protocol
/// constants and are not configurable; only the device identifier and
/// the read timeout are external parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial device to read from.
    pub device: String,
    /// Read timeout in seconds (fractional values allowed).
    pub timeout_secs: f64,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding closed, relocated output files awaiting
    /// conversion. Defaults to `~/.local/share/mrr-ingest/raw`.
    pub raw_dir: Option<PathBuf>,
    /// Directory where the currently open output file is written.
    /// Defaults to `~/.local/share/mrr-ingest/work`.
    pub work_dir: Option<PathBuf>,
}

/// External converter configuration.
///
/// The converter is invoked once per completed hour with the derived
/// product filename as its final argument. It scans the storage directory
/// itself for matching raw inputs; only its exit status is consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Program to invoke.
    pub program: String,
    /// Arguments placed before the product filename.
    pub args: Vec<String>,
}

/// Upload sink configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Whether files are staged for upload at all. When disabled, closed
    /// files and products are still rotated, converted, and deleted, but
    /// nothing is handed to a shipper.
    pub enabled: bool,
    /// Outbox directory for the default sink, where uploaded files are
    /// copied for an external shipper to collect.
    /// Defaults to `~/.local/share/mrr-ingest/outbox`.
    pub outbox_dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            outbox_dir: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB1".to_string(),
            timeout_secs: 1.0,
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["RaProM_38.py".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `MRR_INGEST_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed("MRR_INGEST_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.transport.device.is_empty() {
            return Err(Error::ConfigValidation {
                message: "transport.device must not be empty".to_string(),
            });
        }

        if self.transport.timeout_secs <= 0.0 {
            return Err(Error::ConfigValidation {
                message: format!(
                    "transport.timeout_secs must be greater than 0 (got {})",
                    self.transport.timeout_secs
                ),
            });
        }

        if self.converter.program.is_empty() {
            return Err(Error::ConfigValidation {
                message: "converter.program must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Get the raw storage directory, resolving defaults if not set.
    #[must_use]
    pub fn raw_dir(&self) -> PathBuf {
        self.storage
            .raw_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("raw"))
    }

    /// Get the work directory, resolving defaults if not set.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.storage
            .work_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("work"))
    }

    /// Get the outbox directory, resolving defaults if not set.
    #[must_use]
    pub fn outbox_dir(&self) -> PathBuf {
        self.upload
            .outbox_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("outbox"))
    }

    /// Get the transport read timeout as a Duration.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.transport.timeout_secs)
    }
}
