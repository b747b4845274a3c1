//! Scan configuration and execution.
//!
//! - [`ConfigManager`]: parameters and recipes, with undo/redo and config files
//! - [`Scanner`]: runs the configuration on a background thread
//! - [`ScanControl`]: shared state and pause/stop requests

pub mod config_file;
pub mod config_manager;
pub mod range;
pub mod recipe;
pub mod scanner;
pub mod state;

pub use config_manager::{ConfigListener, ConfigManager};
pub use range::{ScanRange, MAX_POINTS};
pub use recipe::{
    cartesian_product, Parameter, ParameterValues, RecipeKind, RecipeStep, ScanConfig, StepAction,
    StepKind,
};
pub use scanner::{ScanEvent, ScanSummary, Scanner};
pub use state::{Checkpoint, ScanControl, ScanState};
