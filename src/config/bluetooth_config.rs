use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bluetooth::{GattOptions, GattQuirks, ScanConfig};
use crate::config::{duration_ms, LogLevel};
use crate::logging::DebugFlags;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write config file
    #[error("Failed to write config file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[source] serde_json::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[source] serde_json::Error),
}

/// Watchdog bound for each kind of operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "duration_ms")]
    pub connect: Duration,
    #[serde(with = "duration_ms")]
    pub disconnect: Duration,
    #[serde(with = "duration_ms")]
    pub discover_services: Duration,
    /// Characteristic and descriptor reads and writes, RSSI, MTU
    #[serde(with = "duration_ms")]
    pub gatt_operation: Duration,
    #[serde(with = "duration_ms")]
    pub toggle_notify: Duration,
    #[serde(with = "duration_ms")]
    pub pair: Duration,
    #[serde(with = "duration_ms")]
    pub sdp: Duration,
    #[serde(with = "duration_ms")]
    pub socket_connect: Duration,
    /// Socket reads and writes
    #[serde(with = "duration_ms")]
    pub socket_io: Duration,
    #[serde(with = "duration_ms")]
    pub power_toggle: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            disconnect: Duration::from_secs(5),
            discover_services: Duration::from_secs(10),
            gatt_operation: Duration::from_secs(5),
            toggle_notify: Duration::from_secs(5),
            pair: Duration::from_secs(30),
            sdp: Duration::from_secs(15),
            socket_connect: Duration::from_secs(10),
            socket_io: Duration::from_secs(5),
            power_toggle: Duration::from_secs(10),
        }
    }
}

/// Library configuration, stored as JSON
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub timeouts: TimeoutConfig,
    pub scan: ScanConfig,
    pub gatt: GattQuirks,
    pub log_level: LogLevel,
    /// Log file; console only when unset
    pub log_file: Option<PathBuf>,
    /// Debug categories to enable
    pub debug: DebugFlags,
}

impl BluetoothConfig {
    /// Load configuration from `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(ConfigError::ParseFailed)?;
        debug!("[BluetoothConfig::load] loaded {}", path.display());
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_failed = |source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_failed)?;
            }
        }
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, content).map_err(write_failed)?;
        info!("[BluetoothConfig::save] saved {}", path.display());
        Ok(())
    }

    /// Load from the default path; defaults when the file is missing or broken
    pub fn load_or_default() -> Self {
        let path = default_config_path();
        if !path.exists() {
            debug!("[BluetoothConfig::load_or_default] no config at {}", path.display());
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("[BluetoothConfig::load_or_default] {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Per-link settings for a GATT sequencer
    pub fn gatt_options(&self) -> GattOptions {
        GattOptions {
            quirks: self.gatt,
            disconnect_timeout: self.timeouts.disconnect,
        }
    }
}

/// Get the default config path
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|config_dir| config_dir.join("bluelink").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("bluelink.json"))
}
