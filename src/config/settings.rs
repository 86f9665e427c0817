//! Application settings
//!
//! Tunables that are not part of the device configuration file: serial link
//! parameters, handshake timeouts, poll cadence and where sessions are saved.
//! Settings are stored as TOML and every field has a default, so a partial
//! file (or no file at all) is valid.
//!
//! ```toml
//! [serial]
//! baud_rate = 460800
//! command_timeout_ms = 500
//! port_signature = "STMicroelectronics"
//!
//! [session]
//! save_dir = "captures"
//! ```

use crate::error::{DaqError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for the settings directory
pub const APP_ID: &str = "daqlink";

/// Settings filename
pub const SETTINGS_FILE: &str = "settings.toml";

/// Default path of the settings file in the platform config directory
pub fn default_settings_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(SETTINGS_FILE))
}

/// All application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Serial link parameters
    pub serial: SerialSettings,
    /// Device handshake timing
    pub device: DeviceSettings,
    /// Controller and poll loop
    pub acquisition: AcquisitionSettings,
    /// Session save location
    pub session: SessionSettings,
}

impl AppSettings {
    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Settings(format!("Failed to read settings file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| e.with_context(format!("Failed to parse settings file {:?}", path)))
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DaqError::Settings(e.to_string()))
    }

    /// Load settings, falling back to defaults on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path
            .map(Path::to_path_buf)
            .or_else(default_settings_path)
        else {
            return Self::default();
        };

        if !path.exists() {
            tracing::debug!("No settings file at {:?}, using defaults", path);
            return Self::default();
        }

        match Self::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("{}; using default settings", e);
                Self::default()
            }
        }
    }

    /// Save settings as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DaqError::Settings(format!("Failed to create settings directory: {}", e))
            })?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DaqError::Settings(format!("Failed to serialize settings: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            DaqError::Settings(format!("Failed to write settings file {:?}: {}", path, e))
        })
    }
}

/// Serial link parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Fixed baud rate of the instruments
    pub baud_rate: u32,
    /// Timeout for reading a reply line
    pub command_timeout_ms: u64,
    /// Text a port descriptor must contain to be scanned
    pub port_signature: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: crate::backend::serial_channel::DEFAULT_BAUD_RATE,
            command_timeout_ms: 500,
            port_signature: "STMicroelectronics".to_string(),
        }
    }
}

impl SerialSettings {
    /// Reply timeout as a duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Stop handshake timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// How long to wait for any reply after the first STOP
    pub stop_timeout_ms: u64,
    /// Upper bound for draining in-flight telemetry after STOP
    pub drain_timeout_ms: u64,
    /// Pause between drain passes
    pub drain_interval_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 1000,
            drain_timeout_ms: 2000,
            drain_interval_ms: 10,
        }
    }
}

impl DeviceSettings {
    /// Stop reply timeout
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Drain deadline
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Drain pass interval
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Controller and poll loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Device configuration file read on connect
    pub config_path: PathBuf,
    /// Poll interval used when no sampling period is configured
    pub fallback_poll_ms: u32,
    /// Capacity of the notification queue
    pub event_queue_capacity: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.txt"),
            fallback_poll_ms: 100,
            event_queue_capacity: 1024,
        }
    }
}

/// Where and how sessions are saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Directory receiving saved sessions
    pub save_dir: PathBuf,
    /// Filename stem, suffixed with `_1`, `_2`, ... when taken
    pub base_name: String,
    /// Filename extension without the dot
    pub extension: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("."),
            base_name: "data".to_string(),
            extension: "txt".to_string(),
        }
    }
}
