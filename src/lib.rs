//! # Lab Sweep Core Library
//!
//! Instrument control and parameter scans for lab automation. Drivers describe
//! their capabilities as a tree of modules, variables and actions; scans sweep
//! writable variables over ranges of values and record what a recipe of steps
//! measures at every point.
//!
//! ## Crate Structure
//!
//! - **`element`**: The capability tree (`Module`, `Variable`, `Action`) built from driver
//!   descriptors, and the typed `Value`s flowing through it.
//! - **`device`**: `Device` (root module plus the per-device call lock) and the
//!   `DeviceRegistry` that opens devices by name and resolves dotted addresses.
//! - **`hardware`**: Simulated drivers for tests and demos.
//! - **`experiment`**: `ConfigManager` (parameters and recipes, undo/redo, config files),
//!   `Scanner` (the scan thread) and the shared `ScanControl`.
//! - **`data`**: `Dataset`, the CSV table and side files a scan records.
//! - **`interactive`**: Single device operations on the blocking pool for async callers.
//! - **`config`**: Application settings loaded from TOML and the environment.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The `LabError` enum shared by every module.

pub mod config;
pub mod data;
pub mod device;
pub mod element;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod interactive;
pub mod logging;

pub use error::{AppResult, LabError};
