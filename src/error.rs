//! Custom error types for the library.
//!
//! This module defines the primary error type, `LabError`, shared by the element
//! tree, the configuration manager, the scanner and the dataset recorder.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: a driver model could not be turned into an element tree
//!   (duplicate name, missing field, unknown type). Raised only while a device is
//!   being built; the device is not loaded.
//! - **`Usage`**: an element was called the wrong way (reading a write-only
//!   variable, missing action argument, value that cannot be coerced). The caller
//!   can recover.
//! - **`Communication`**: the driver callback failed. The driver error is kept
//!   unchanged as the source; only the element address is attached.
//! - **`NotFound`**: a dotted address does not resolve in the loaded tree.
//! - **`ScanRunning`** / **`InvalidState`**: the request conflicts with the
//!   scanner state machine.
//! - **`ConfigFile`** / **`Recipe`**: problems with a scan configuration.
//!
//! Every element-related variant carries the dotted address of the element so
//! a multi-instrument setup can be debugged from the message alone.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

/// Errors raised by devices, element calls, scan configuration and scans.
#[derive(Error, Debug)]
pub enum LabError {
    /// A driver model could not be built into an element tree.
    #[error("Configuration error at '{address}': {message}")]
    Configuration {
        /// Address of the offending element
        address: String,
        /// What is wrong with the model
        message: String,
    },

    /// An element was called the wrong way.
    #[error("Usage error at '{address}': {message}")]
    Usage {
        /// Address of the element called
        address: String,
        /// What is wrong with the call
        message: String,
    },

    /// The driver callback failed.
    #[error("Communication error at '{address}': {source}")]
    Communication {
        /// Address of the element called
        address: String,
        /// Error returned by the driver
        #[source]
        source: anyhow::Error,
    },

    /// A dotted address does not resolve.
    #[error("Element '{address}' not found")]
    NotFound {
        /// The address looked up
        address: String,
    },

    /// The scan configuration cannot change while a scan is running.
    #[error("Operation rejected: a scan is running")]
    ScanRunning,

    /// The request does not fit the scanner state.
    #[error("Invalid scanner state: {0}")]
    InvalidState(String),

    /// The recipe cannot be run or recorded.
    #[error("Recipe error: {0}")]
    Recipe(String),

    /// A scan configuration file cannot be read.
    #[error("Config file '{path}': {message}")]
    ConfigFile {
        /// File, or `<string>` for in-memory text
        path: String,
        /// What is wrong with the file
        message: String,
    },

    /// Application settings could not be loaded.
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// Application settings were loaded but are invalid.
    #[error("Settings validation error: {0}")]
    SettingsValidation(String),

    /// The tracing subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dataset table failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON encoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A background worker died before returning.
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl LabError {
    pub(crate) fn configuration(address: impl Into<String>, message: impl Into<String>) -> Self {
        LabError::Configuration {
            address: address.into(),
            message: message.into(),
        }
    }

    pub(crate) fn usage(address: impl Into<String>, message: impl Into<String>) -> Self {
        LabError::Usage {
            address: address.into(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(address: impl Into<String>) -> Self {
        LabError::NotFound {
            address: address.into(),
        }
    }

    /// Dotted address of the element the error originates from, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            LabError::Configuration { address, .. }
            | LabError::Usage { address, .. }
            | LabError::Communication { address, .. }
            | LabError::NotFound { address } => Some(address),
            _ => None,
        }
    }

    /// Whether the caller can retry or correct the request without reloading
    /// the device.
    pub fn can_recover(&self) -> bool {
        !matches!(
            self,
            LabError::Configuration { .. } | LabError::Settings(_) | LabError::Io(_)
        )
    }
}

impl From<figment::Error> for LabError {
    fn from(value: figment::Error) -> Self {
        LabError::Settings(Box::new(value))
    }
}
