//! Mock Hardware Implementations
//!
//! Simulated instruments for testing and demos without physical hardware.
//! Reads are deterministic functions of the written state so scans over mock
//! devices produce reproducible datasets.
//!
//! # Available Mocks
//!
//! - `MockInstrument` (`mock_instrument`) - source/detector pair with scalar,
//!   array, table and bytes outputs and a `channel` sub-module
//! - `MockStage` (`mock_stage`) - single axis stage with homing
//!
//! # Options
//!
//! `mock_instrument` reads an optional `gain` (float, default 2.0) from the
//! device options; `mock_stage` an optional `limit` (float, default 100.0).

use crate::config::DeviceConfig;
use crate::device::DeviceRegistry;
use crate::element::{Descriptor, DriverModelProvider, Table, Value, ValueType};
use anyhow::{anyhow, bail, Result};
use ndarray::Array2;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Registers every mock driver under its driver name.
pub fn register_drivers(registry: &DeviceRegistry) {
    registry.register_driver("mock_instrument", |config: &DeviceConfig| {
        let gain = option_f64(config, "gain")?.unwrap_or(2.0);
        Ok(Arc::new(MockInstrument::with_gain(gain)) as Arc<dyn DriverModelProvider>)
    });
    registry.register_driver("mock_stage", |config: &DeviceConfig| {
        let limit = option_f64(config, "limit")?.unwrap_or(100.0);
        Ok(Arc::new(MockStage::with_limit(limit)) as Arc<dyn DriverModelProvider>)
    });
}

fn option_f64(config: &DeviceConfig, key: &str) -> Result<Option<f64>> {
    match config.options.get(key) {
        None => Ok(None),
        Some(toml::Value::Float(v)) => Ok(Some(*v)),
        Some(toml::Value::Integer(v)) => Ok(Some(*v as f64)),
        Some(other) => Err(anyhow!("option '{key}' must be a number, got {other}")),
    }
}

// =============================================================================
// MockInstrument - Simulated Source/Detector
// =============================================================================

#[derive(Debug)]
struct InstrumentState {
    amplitude: f64,
    gain: f64,
    enabled: bool,
    label: String,
}

/// Simulated source/detector pair
///
/// - `amplitude` (float, V, read/write, read on load)
/// - `power` (float, W, read only): `gain * amplitude^2` while enabled
/// - `enabled` (bool, read/write)
/// - `label` (str, read/write)
/// - `spectrum` (array, read only): 16 samples scaled by the amplitude
/// - `trace` (table, read only): `time`/`signal` columns
/// - `raw` (bytes, read only)
/// - `trigger` (action), `set_gain` (action, float argument)
/// - `channel` (module): `offset` (float, read/write), `reading` (float, read only)
pub struct MockInstrument {
    state: Arc<Mutex<InstrumentState>>,
    triggers: Arc<AtomicU64>,
    channel: Arc<MockChannel>,
    closed: AtomicBool,
}

impl MockInstrument {
    /// Instrument with a gain of 2.
    pub fn new() -> Self {
        Self::with_gain(2.0)
    }

    /// Instrument whose detected power is scaled by `gain`.
    pub fn with_gain(gain: f64) -> Self {
        let state = Arc::new(Mutex::new(InstrumentState {
            amplitude: 0.0,
            gain,
            enabled: true,
            label: "mock".to_string(),
        }));
        Self {
            channel: Arc::new(MockChannel {
                instrument: state.clone(),
                offset: Mutex::new(0.0),
            }),
            state,
            triggers: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of times `trigger` ran.
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }

    /// Whether the device was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverModelProvider for MockInstrument {
    fn driver_model(self: Arc<Self>) -> Vec<Descriptor> {
        let reader = |f: fn(&InstrumentState) -> Value| {
            let state = self.state.clone();
            move || -> Result<Value> { Ok(f(&state.lock())) }
        };
        let writer = |f: fn(&mut InstrumentState, Value) -> Result<()>| {
            let state = self.state.clone();
            move |value: Value| f(&mut state.lock(), value)
        };
        let triggers = self.triggers.clone();
        let gain_state = self.state.clone();

        vec![
            Descriptor::variable("amplitude")
                .value_type(ValueType::Float)
                .unit("V")
                .read(reader(|s| Value::Float(s.amplitude)))
                .write(writer(|s, value| {
                    s.amplitude = as_f64(&value)?;
                    Ok(())
                }))
                .read_init(true)
                .help("Output amplitude"),
            Descriptor::variable("power")
                .value_type(ValueType::Float)
                .unit("W")
                .read(reader(|s| {
                    let power = if s.enabled {
                        s.gain * s.amplitude * s.amplitude
                    } else {
                        0.0
                    };
                    Value::Float(power)
                }))
                .help("Detected power"),
            Descriptor::variable("enabled")
                .value_type(ValueType::Bool)
                .read(reader(|s| Value::Bool(s.enabled)))
                .write(writer(|s, value| match value {
                    Value::Bool(enabled) => {
                        s.enabled = enabled;
                        Ok(())
                    }
                    other => bail!("expected bool, got {other}"),
                })),
            Descriptor::variable("label")
                .value_type(ValueType::String)
                .read(reader(|s| Value::String(s.label.clone())))
                .write(writer(|s, value| {
                    s.label = value.to_string();
                    Ok(())
                })),
            Descriptor::variable("spectrum")
                .value_type(ValueType::Array)
                .read(reader(|s| {
                    let samples = (0..16_i32)
                        .map(|i| s.amplitude * (f64::from(i) * 0.4).sin())
                        .collect();
                    Value::array(samples)
                }))
                .help("Spectrum scaled by the amplitude"),
            Descriptor::variable("trace")
                .value_type(ValueType::Table)
                .read(reader(|s| {
                    let data = Array2::from_shape_fn((8, 2), |(row, col)| {
                        let t = row as f64 * 0.1;
                        if col == 0 {
                            t
                        } else {
                            s.amplitude * (-t).exp()
                        }
                    });
                    Value::Table(Table {
                        columns: vec!["time".to_string(), "signal".to_string()],
                        data,
                    })
                })),
            Descriptor::variable("raw")
                .value_type(ValueType::Bytes)
                .read(reader(|s| Value::Bytes(s.amplitude.to_le_bytes().to_vec()))),
            Descriptor::action("trigger")
                .do_fn(move |_| {
                    triggers.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .help("Software trigger"),
            Descriptor::action("set_gain")
                .param_type(ValueType::Float)
                .do_fn(move |value| {
                    let gain = value
                        .as_ref()
                        .and_then(Value::as_f64)
                        .ok_or_else(|| anyhow!("set_gain needs a number"))?;
                    if gain < 0.0 {
                        bail!("gain must be positive, got {gain}");
                    }
                    gain_state.lock().gain = gain;
                    Ok(())
                }),
            Descriptor::module("channel", self.channel.clone()).help("Detector channel"),
        ]
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Detector channel of [`MockInstrument`]
struct MockChannel {
    instrument: Arc<Mutex<InstrumentState>>,
    offset: Mutex<f64>,
}

impl DriverModelProvider for MockChannel {
    fn driver_model(self: Arc<Self>) -> Vec<Descriptor> {
        let (read_offset, write_offset, reading) = (self.clone(), self.clone(), self);
        vec![
            Descriptor::variable("offset")
                .value_type(ValueType::Float)
                .unit("V")
                .read(move || Ok(Value::Float(*read_offset.offset.lock())))
                .write(move |value| {
                    *write_offset.offset.lock() = as_f64(&value)?;
                    Ok(())
                }),
            Descriptor::variable("reading")
                .value_type(ValueType::Float)
                .unit("V")
                .read(move || {
                    let amplitude = reading.instrument.lock().amplitude;
                    Ok(Value::Float(amplitude + *reading.offset.lock()))
                }),
        ]
    }
}

// =============================================================================
// MockStage - Simulated Single Axis
// =============================================================================

/// Simulated single-axis stage
///
/// - `position` (float, mm, read/write): writes outside `±limit` fail
/// - `moves` (int, read only): number of accepted moves
/// - `home` (action): moves back to zero
pub struct MockStage {
    position: Arc<Mutex<f64>>,
    moves: Arc<AtomicU64>,
    limit: f64,
}

impl MockStage {
    /// Stage limited to ±100 mm.
    pub fn new() -> Self {
        Self::with_limit(100.0)
    }

    /// Stage limited to ±`limit` mm.
    pub fn with_limit(limit: f64) -> Self {
        Self {
            position: Arc::new(Mutex::new(0.0)),
            moves: Arc::new(AtomicU64::new(0)),
            limit,
        }
    }

    /// Number of accepted position writes.
    pub fn move_count(&self) -> u64 {
        self.moves.load(Ordering::SeqCst)
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverModelProvider for MockStage {
    fn driver_model(self: Arc<Self>) -> Vec<Descriptor> {
        let (read_position, write_position, home_position) = (
            self.position.clone(),
            self.position.clone(),
            self.position.clone(),
        );
        let (write_moves, read_moves) = (self.moves.clone(), self.moves.clone());
        let limit = self.limit;

        vec![
            Descriptor::variable("position")
                .value_type(ValueType::Float)
                .unit("mm")
                .read(move || Ok(Value::Float(*read_position.lock())))
                .write(move |value| {
                    let target = as_f64(&value)?;
                    if target.abs() > limit {
                        bail!("target {target} mm outside ±{limit} mm");
                    }
                    *write_position.lock() = target;
                    write_moves.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            Descriptor::variable("moves")
                .value_type(ValueType::Int)
                .read(move || Ok(Value::Int(read_moves.load(Ordering::SeqCst) as i64))),
            Descriptor::action("home").do_fn(move |_| {
                *home_position.lock() = 0.0;
                Ok(())
            }),
        ]
    }
}

fn as_f64(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| anyhow!("expected a number, got {value}"))
}
