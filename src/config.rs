//! # Configuration Management Module
//!
//! Persistent recorder settings stored in platform-appropriate locations.
//! Handles loading, saving, validating and providing defaults.
//!
//! ## Settings
//! - `save_root`: Parent folder of every session folder
//! - `timeframe_capacity`: Live samples kept in memory per timeframe
//! - `flush_threshold`: Evicted samples batched before a write is issued
//! - `sample_rate_hz`: Default sample-rate hint passed to drivers
//! - `max_flush_retries`: Retries of a failed write while finishing
//! - `index_file`: Name of the session index under `save_root`
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/sensible-recorder/config.toml
//! - Linux: ~/.config/sensible-recorder/config.toml
//! - Windows: %APPDATA%\sensible-recorder\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "sensible-recorder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub save_root: PathBuf,
    pub timeframe_capacity: usize,
    pub flush_threshold: usize,
    pub sample_rate_hz: u32,
    pub max_flush_retries: u32,
    pub index_file: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            save_root: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("recordings"),
            timeframe_capacity: 10,
            flush_threshold: 5,
            sample_rate_hz: 40_000,
            max_flush_retries: 3,
            index_file: "sessions.txt".to_string(),
        }
    }
}

impl RecorderConfig {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load config from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, writing the defaults there if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Self = toml::from_str(&contents)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeframe_capacity == 0 {
            return Err(ConfigError::Invalid(
                "timeframe_capacity must be at least 1".to_string(),
            ));
        }
        if self.flush_threshold == 0 {
            return Err(ConfigError::Invalid(
                "flush_threshold must be at least 1".to_string(),
            ));
        }
        if self.index_file.trim().is_empty() {
            return Err(ConfigError::Invalid("index_file must not be empty".to_string()));
        }
        Ok(())
    }

    /// Full path of the session index
    pub fn index_path(&self) -> PathBuf {
        self.save_root.join(&self.index_file)
    }
}
