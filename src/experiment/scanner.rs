//! Scan execution.
//!
//! A [`Scanner`] runs the configuration of its [`ConfigManager`] on a single
//! background thread:
//!
//! 1. the init recipe, recorded as row `0`
//! 2. for every point of the cartesian product of the parameters (last
//!    parameter fastest): the parameter values that changed since the previous
//!    point, then the recipe, recorded as rows `1..=N`
//! 3. the end recipe, recorded as row `N+1`
//!
//! Pause and stop requests are honoured between steps and between points
//! only; a call already sent to an instrument always completes. A stopped or
//! failed scan keeps every row recorded so far, drops the row in progress and
//! skips the end recipe.
//!
//! In continuous mode a scan that completes starts over at once with a new
//! run folder and dataset, until [`Scanner::stop`] is called or a pass fails.
//!
//! # Example
//!
//! ```no_run
//! use lab_sweep::config::ScannerSettings;
//! use lab_sweep::experiment::{ConfigManager, ScanControl, Scanner, StepKind};
//! use lab_sweep::device::DeviceRegistry;
//! use lab_sweep::config::DeviceConfig;
//! use parking_lot::RwLock;
//! use std::sync::Arc;
//!
//! let registry = DeviceRegistry::with_builtin_drivers();
//! registry.add_config(DeviceConfig::new("laser", "mock_instrument"))?;
//! registry.open("laser")?;
//!
//! let config = Arc::new(RwLock::new(ConfigManager::new(ScanControl::new())));
//! let scanner = Scanner::new(config.clone(), ScannerSettings::default());
//! config.write().add_recipe_step(
//!     StepKind::Measure,
//!     Some(registry.resolve("laser.power")?),
//!     None,
//!     None,
//! )?;
//!
//! scanner.start()?;
//! let summary = scanner.wait()?;
//! println!("{} rows in {}", summary.rows, summary.folder.display());
//! # Ok::<(), lab_sweep::error::LabError>(())
//! ```

use super::config_file;
use super::config_manager::ConfigManager;
use super::recipe::{Parameter, RecipeStep, ScanConfig, StepAction};
use super::state::{Checkpoint, ScanControl, ScanState};
use crate::config::ScannerSettings;
use crate::data::dataset::CONFIG_FILE;
use crate::data::{Column, Dataset, DatasetStore};
use crate::element::Value;
use crate::error::{AppResult, LabError};
use chrono::Local;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Progress notifications of a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A pass began recording into a new run folder
    Started {
        /// Run identifier
        run_id: String,
        /// Run folder
        folder: PathBuf,
        /// Number of parameter points
        points: usize,
    },
    /// A parameter was written before running the recipe of row `id`
    ParameterSet {
        /// Row id
        id: u64,
        /// Parameter name
        name: String,
        /// Value written
        value: Value,
    },
    /// A step is about to run
    StepStarted {
        /// Row id
        id: u64,
        /// Step name
        name: String,
    },
    /// A step ran
    StepFinished {
        /// Row id
        id: u64,
        /// Step name
        name: String,
        /// Value recorded by the step
        value: Option<Value>,
    },
    /// A row reached the dataset
    RowRecorded {
        /// Row id
        id: u64,
    },
    /// The scan thread is parked
    Paused,
    /// The scan thread left a pause
    Resumed,
    /// The scan aborted; `Finished` follows
    Error {
        /// Error message
        message: String,
    },
    /// The pass ended
    Finished {
        /// Rows recorded
        rows: usize,
        /// Whether a stop request ended it
        stopped: bool,
    },
}

/// Result of a completed, stopped or failed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Run identifier
    pub run_id: String,
    /// Run folder
    pub folder: PathBuf,
    /// Rows recorded, init and end rows included
    pub rows: usize,
    /// Whether a stop request ended the scan
    pub stopped: bool,
}

/// Runs scans of the configuration held by a [`ConfigManager`].
pub struct Scanner {
    config: Arc<RwLock<ConfigManager>>,
    control: Arc<ScanControl>,
    settings: ScannerSettings,
    datasets: Arc<DatasetStore>,
    events: broadcast::Sender<ScanEvent>,
    continuous: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<AppResult<ScanSummary>>>>,
}

impl Scanner {
    /// Creates a scanner sharing the scan control of `config`.
    ///
    /// Recorded datasets are dropped whenever the configuration changes.
    pub fn new(config: Arc<RwLock<ConfigManager>>, settings: ScannerSettings) -> Self {
        let datasets = DatasetStore::new();
        let control = {
            let manager = config.read();
            let store = datasets.clone();
            manager.on_change(move |_| store.clear());
            manager.control().clone()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let continuous = Arc::new(AtomicBool::new(settings.continuous));

        Self {
            config,
            control,
            settings,
            datasets,
            events,
            continuous,
            worker: Mutex::new(None),
        }
    }

    /// Configuration the scanner runs.
    pub fn config(&self) -> &Arc<RwLock<ConfigManager>> {
        &self.config
    }

    /// Scan control shared with the configuration.
    pub fn control(&self) -> &Arc<ScanControl> {
        &self.control
    }

    /// Recording settings.
    pub fn settings(&self) -> &ScannerSettings {
        &self.settings
    }

    /// Current scan state.
    pub fn state(&self) -> ScanState {
        self.control.state()
    }

    /// Whether a scan is armed, running or paused.
    pub fn is_running(&self) -> bool {
        self.control.state().is_active()
    }

    /// Whether a completed scan starts over.
    pub fn is_continuous(&self) -> bool {
        self.continuous.load(Ordering::SeqCst)
    }

    /// Switches continuous mode; takes effect at the end of the current pass.
    pub fn set_continuous(&self, continuous: bool) {
        self.continuous.store(continuous, Ordering::SeqCst);
        debug!(continuous, "continuous mode changed");
    }

    /// Receiver of the scan events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Datasets recorded since the last configuration change.
    pub fn datasets(&self) -> &Arc<DatasetStore> {
        &self.datasets
    }

    /// Dataset of the most recent run.
    pub fn last_dataset(&self) -> Option<Arc<RwLock<Dataset>>> {
        self.datasets.last()
    }

    /// Starts a scan of the current configuration in the background.
    ///
    /// Creates the run folder, with a copy of the configuration when
    /// `save_config` is set, and returns the dataset being filled.
    #[instrument(skip(self), fields(data_dir = %self.settings.data_dir.display()))]
    pub fn start(&self) -> AppResult<Arc<RwLock<Dataset>>> {
        // Armed while the read guard is held: no mutation can commit between
        // the snapshot and the run.
        let config = {
            let manager = self.config.read();
            self.control.arm()?;
            manager.snapshot()
        };
        self.reap_worker();

        let (points, run_id, dataset) = match self.prepare(&config) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.control.finish();
                return Err(e);
            }
        };
        self.datasets.push(dataset.clone());

        let run = ScanRun {
            config,
            points,
            control: self.control.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
            datasets: self.datasets.clone(),
            continuous: self.continuous.clone(),
        };
        let pass = Pass {
            run_id: run_id.clone(),
            dataset: dataset.clone(),
        };
        let spawned = thread::Builder::new()
            .name("scan-thread".to_string())
            .spawn(move || run.execute(pass));
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                info!(run_id = %run_id, "scan started");
                Ok(dataset)
            }
            Err(e) => {
                self.control.finish();
                Err(e.into())
            }
        }
    }

    /// Requests a pause at the next checkpoint.
    pub fn pause(&self) -> AppResult<()> {
        self.control.request_pause()?;
        info!("scan pause requested");
        Ok(())
    }

    /// Releases a paused scan.
    pub fn resume(&self) -> AppResult<()> {
        self.control.resume()?;
        info!("scan resume requested");
        Ok(())
    }

    /// Requests a stop and leaves continuous mode.
    pub fn stop(&self) -> AppResult<()> {
        self.continuous.store(false, Ordering::SeqCst);
        self.control.request_stop()?;
        info!("scan stop requested");
        Ok(())
    }

    /// Blocks until the current scan thread ends and returns its outcome.
    pub fn wait(&self) -> AppResult<ScanSummary> {
        let handle = self
            .worker
            .lock()
            .take()
            .ok_or_else(|| LabError::InvalidState("no scan was started".to_string()))?;
        handle
            .join()
            .map_err(|_| LabError::Worker("scan thread panicked".to_string()))?
    }

    fn prepare(
        &self,
        config: &ScanConfig,
    ) -> AppResult<(Vec<Vec<Value>>, String, Arc<RwLock<Dataset>>)> {
        if config.recipe.is_empty() {
            return Err(LabError::Recipe("the recipe has no step".to_string()));
        }
        let points = config.points()?;
        let run_id = Uuid::new_v4().to_string();
        let dataset = prepare_run(&self.settings, config, &run_id)?;
        Ok((points, run_id, dataset))
    }

    /// Joins a previous scan thread that already left the running state.
    fn reap_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            match handle.join() {
                Ok(Err(e)) => debug!(error = %e, "previous scan had failed"),
                Err(_) => warn!("previous scan thread panicked"),
                Ok(Ok(_)) => {}
            }
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if self.control.state().is_active() {
            let _ = self.control.request_stop();
        }
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("state", &self.control.state())
            .field("settings", &self.settings)
            .field("datasets", &self.datasets.len())
            .finish()
    }
}

/// Creates the run folder and its dataset, with a copy of `config` when
/// `save_config` is set.
fn prepare_run(
    settings: &ScannerSettings,
    config: &ScanConfig,
    run_id: &str,
) -> AppResult<Arc<RwLock<Dataset>>> {
    let short_id = run_id.split('-').next().unwrap_or(run_id);
    let folder = settings.data_dir.join(format!(
        "{}_{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        short_id
    ));
    let dataset = Dataset::create(&folder, columns(config))?;
    if settings.save_config {
        fs::write(folder.join(CONFIG_FILE), config_file::to_config_string(config)?)?;
    }
    Ok(Arc::new(RwLock::new(dataset)))
}

/// Dataset columns: every parameter and every step that records a value.
fn columns(config: &ScanConfig) -> Vec<Column> {
    let step_column = |step: &RecipeStep| {
        step.recorded_type()
            .map(|value_type| Column::new(step.name(), value_type))
    };
    config
        .init_recipe
        .iter()
        .filter_map(step_column)
        .chain(
            config
                .parameters
                .iter()
                .map(|p| Column::new(p.name(), p.variable().value_type())),
        )
        .chain(config.recipe.iter().filter_map(step_column))
        .chain(config.end_recipe.iter().filter_map(step_column))
        .collect()
}

// =============================================================================
// Scan thread
// =============================================================================

/// Whether a scan section ran to its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Done,
    Stopped,
}

struct ScanRun {
    config: ScanConfig,
    points: Vec<Vec<Value>>,
    control: Arc<ScanControl>,
    events: broadcast::Sender<ScanEvent>,
    settings: ScannerSettings,
    datasets: Arc<DatasetStore>,
    continuous: Arc<AtomicBool>,
}

/// The dataset being filled by one pass of the scan.
struct Pass {
    run_id: String,
    dataset: Arc<RwLock<Dataset>>,
}

impl ScanRun {
    /// Runs passes until one is stopped, fails, or completes outside
    /// continuous mode; returns the outcome of the last pass.
    fn execute(self, mut pass: Pass) -> AppResult<ScanSummary> {
        self.control.begin();

        let result = loop {
            let result = self.execute_pass(&pass);
            let again = matches!(&result, Ok(summary) if !summary.stopped)
                && self.continuous.load(Ordering::SeqCst)
                && !self.control.is_stop_requested();
            if !again {
                break result;
            }

            let run_id = Uuid::new_v4().to_string();
            match prepare_run(&self.settings, &self.config, &run_id) {
                Ok(dataset) => {
                    info!(run_id = %run_id, "continuous scan starting over");
                    self.datasets.push(dataset.clone());
                    pass = Pass { run_id, dataset };
                }
                Err(e) => {
                    error!(error = %e, "continuous scan could not start over");
                    self.emit(ScanEvent::Error {
                        message: e.to_string(),
                    });
                    break Err(e);
                }
            }
        };

        if result.is_err() {
            self.continuous.store(false, Ordering::SeqCst);
        }
        self.control.finish();
        result
    }

    fn execute_pass(&self, pass: &Pass) -> AppResult<ScanSummary> {
        let span = info_span!("scan", run_id = %pass.run_id);
        let _enter = span.enter();

        let folder = pass.dataset.read().folder().to_path_buf();
        self.emit(ScanEvent::Started {
            run_id: pass.run_id.clone(),
            folder: folder.clone(),
            points: self.points.len(),
        });

        let outcome = self.run(&pass.dataset);
        let rows = pass.dataset.read().len();

        match outcome {
            Ok(flow) => {
                let stopped = flow == Flow::Stopped;
                info!(rows, stopped, "scan finished");
                self.emit(ScanEvent::Finished { rows, stopped });
                Ok(ScanSummary {
                    run_id: pass.run_id.clone(),
                    folder,
                    rows,
                    stopped,
                })
            }
            Err(e) => {
                error!(error = %e, rows, "scan aborted");
                self.emit(ScanEvent::Error {
                    message: e.to_string(),
                });
                self.emit(ScanEvent::Finished {
                    rows,
                    stopped: false,
                });
                Err(e)
            }
        }
    }

    fn run(&self, dataset: &RwLock<Dataset>) -> AppResult<Flow> {
        if !self.config.init_recipe.is_empty() {
            let mut row = IndexMap::new();
            if self.run_steps(0, &self.config.init_recipe, &mut row)? == Flow::Stopped {
                return Ok(Flow::Stopped);
            }
            self.record(dataset, 0, row)?;
        }

        let mut previous: Option<&[Value]> = None;
        for (index, point) in self.points.iter().enumerate() {
            let id = index as u64 + 1;
            if self.checkpoint() == Checkpoint::Stop {
                return Ok(Flow::Stopped);
            }

            let mut row = IndexMap::new();
            for (axis, (parameter, value)) in self.config.parameters.iter().zip(point).enumerate() {
                let changed = previous.map_or(true, |previous| previous[axis] != *value);
                if changed {
                    self.apply(id, parameter, value)?;
                }
                row.insert(parameter.name().to_string(), value.clone());
            }
            previous = Some(point.as_slice());

            if self.run_steps(id, &self.config.recipe, &mut row)? == Flow::Stopped {
                return Ok(Flow::Stopped);
            }
            if self.control.is_stop_requested() {
                return Ok(Flow::Stopped);
            }
            self.record(dataset, id, row)?;
        }

        if !self.config.end_recipe.is_empty() {
            if self.checkpoint() == Checkpoint::Stop {
                return Ok(Flow::Stopped);
            }
            let id = self.points.len() as u64 + 1;
            let mut row = IndexMap::new();
            if self.run_steps(id, &self.config.end_recipe, &mut row)? == Flow::Stopped {
                return Ok(Flow::Stopped);
            }
            self.record(dataset, id, row)?;
        }
        Ok(Flow::Done)
    }

    fn apply(&self, id: u64, parameter: &Parameter, value: &Value) -> AppResult<()> {
        let written = parameter.variable().write(value.clone())?;
        debug!(id, parameter = parameter.name(), value = %written, "parameter set");
        self.emit(ScanEvent::ParameterSet {
            id,
            name: parameter.name().to_string(),
            value: written,
        });
        Ok(())
    }

    /// Runs `steps` in order, collecting recorded values into `row`.
    fn run_steps(
        &self,
        id: u64,
        steps: &[RecipeStep],
        row: &mut IndexMap<String, Value>,
    ) -> AppResult<Flow> {
        for (position, step) in steps.iter().enumerate() {
            if position > 0 && self.checkpoint() == Checkpoint::Stop {
                return Ok(Flow::Stopped);
            }
            self.emit(ScanEvent::StepStarted {
                id,
                name: step.name().to_string(),
            });

            let value = match step.action() {
                StepAction::Wait(delay) => {
                    if self.control.sleep(*delay) == Checkpoint::Stop {
                        return Ok(Flow::Stopped);
                    }
                    None
                }
                _ => step.run()?,
            };

            debug!(id, step = step.name(), "step finished");
            if let Some(value) = &value {
                row.insert(step.name().to_string(), value.clone());
            }
            self.emit(ScanEvent::StepFinished {
                id,
                name: step.name().to_string(),
                value,
            });
        }
        Ok(Flow::Done)
    }

    fn record(
        &self,
        dataset: &RwLock<Dataset>,
        id: u64,
        row: IndexMap<String, Value>,
    ) -> AppResult<()> {
        dataset.write().record(id, row)?;
        self.emit(ScanEvent::RowRecorded { id });
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        self.control.checkpoint(|state| match state {
            ScanState::Paused => {
                info!("scan paused");
                self.emit(ScanEvent::Paused);
            }
            _ => {
                info!("scan resumed");
                self.emit(ScanEvent::Resumed);
            }
        })
    }

    fn emit(&self, event: ScanEvent) {
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{DeviceLink, Module, ValueType};
    use crate::experiment::recipe::StepKind;
    use crate::hardware::mock::MockInstrument;

    fn settings(dir: &std::path::Path) -> ScannerSettings {
        ScannerSettings {
            data_dir: dir.to_path_buf(),
            ..ScannerSettings::default()
        }
    }

    #[test]
    fn test_columns_skip_wait_steps() {
        let link = DeviceLink::new("dev");
        let dev = Module::build("dev", Arc::new(MockInstrument::new()), &link).unwrap();
        let mut manager = ConfigManager::new(ScanControl::new());
        manager
            .set_parameter(dev.get_variable("amplitude").unwrap(), Some("amp"))
            .unwrap();
        manager
            .add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(0.0)))
            .unwrap();
        manager
            .add_recipe_step(StepKind::Execute, Some(dev.resolve("trigger").unwrap()), None, None)
            .unwrap();
        manager
            .add_recipe_step(StepKind::Measure, Some(dev.resolve("spectrum").unwrap()), None, None)
            .unwrap();

        let columns = columns(manager.config());
        assert_eq!(
            columns,
            vec![
                Column::new("amp", ValueType::Float),
                Column::new("spectrum", ValueType::Array),
            ]
        );
    }

    #[test]
    fn test_empty_recipe_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(RwLock::new(ConfigManager::new(ScanControl::new())));
        let scanner = Scanner::new(config, settings(dir.path()));
        assert!(matches!(scanner.start(), Err(LabError::Recipe(_))));
        assert_eq!(scanner.state(), ScanState::Idle);
        assert!(scanner.wait().is_err());
    }

    #[test]
    fn test_config_change_clears_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(RwLock::new(ConfigManager::new(ScanControl::new())));
        let scanner = Scanner::new(config.clone(), settings(dir.path()));
        config
            .write()
            .add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(0.0)))
            .unwrap();

        scanner.start().unwrap();
        let summary = scanner.wait().unwrap();
        assert_eq!(summary.rows, 1);
        assert!(summary.folder.join(CONFIG_FILE).exists());
        assert_eq!(scanner.datasets().len(), 1);

        config.write().remove_recipe_step("wait").unwrap();
        assert!(scanner.datasets().is_empty());
    }
}
