//! Application settings using Figment
//!
//! Settings are loaded from:
//! 1. `config/lab_sweep.toml` (base configuration)
//! 2. Environment variables prefixed with `LAB_SWEEP_`, nested keys separated
//!    by `__` (e.g. `LAB_SWEEP_SCANNER__DATA_DIR=/data/runs`)
//!
//! # Example
//! ```no_run
//! use lab_sweep::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Recording into {}", settings.scanner.data_dir.display());
//! # Ok::<(), lab_sweep::error::LabError>(())
//! ```

use crate::element::clean_name;
use crate::error::{AppResult, LabError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "config/lab_sweep.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Scan recording settings
    #[serde(default)]
    pub scanner: ScannerSettings,
    /// Instrument connections the device registry can open
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Scan recording settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Folder under which one sub-folder per run is created
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Write the run's scan configuration next to its data
    #[serde(default = "default_true")]
    pub save_config: bool,
    /// Number of configuration snapshots kept for undo/redo
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
    /// Start the scan over each time it completes, until stopped
    #[serde(default)]
    pub continuous: bool,
}

/// Connection settings of one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, root of every element address of the device
    pub name: String,
    /// Driver registered in the device registry (e.g. "mock_instrument")
    pub driver: String,
    /// Connection kind understood by the driver (e.g. "VISA", "SOCKET")
    #[serde(default)]
    pub connection: Option<String>,
    /// Connection address (e.g. "GPIB0::2::INSTR", "192.168.0.8:5025")
    #[serde(default)]
    pub address: Option<String>,
    /// Driver-specific options
    #[serde(default)]
    pub options: toml::Table,
}

impl DeviceConfig {
    /// Device `name` using the registered driver `driver`, with no connection settings.
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            connection: None,
            address: None,
            options: toml::Table::new(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "lab_sweep".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_true() -> bool {
    true
}

fn default_history_depth() -> usize {
    50
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            save_config: default_true(),
            history_depth: default_history_depth(),
            continuous: false,
        }
    }
}

impl Settings {
    /// Load settings from `config/lab_sweep.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Load settings from a specific file path
    ///
    /// A missing file is not an error; defaults and environment variables apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LAB_SWEEP_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(LabError::SettingsValidation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scanner.history_depth == 0 {
            return Err(LabError::SettingsValidation(
                "scanner.history_depth must be at least 1".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(LabError::SettingsValidation(
                    "Device with an empty name".to_string(),
                ));
            }
            if clean_name(&device.name) != device.name {
                return Err(LabError::SettingsValidation(format!(
                    "Device name '{}' contains reserved characters",
                    device.name
                )));
            }
            if device.driver.trim().is_empty() {
                return Err(LabError::SettingsValidation(format!(
                    "Device '{}' has no driver",
                    device.name
                )));
            }
            if !names.insert(&device.name) {
                return Err(LabError::SettingsValidation(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Connection settings of the device called `name`
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.name == name)
    }
}
