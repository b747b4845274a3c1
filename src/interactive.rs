//! One-off device operations for async callers.
//!
//! Each helper runs its operation on the blocking thread pool so a UI task is
//! never held up by an instrument. Calls still take the device lock, so they
//! interleave with a running scan only between two of its steps.
//!
//! ```no_run
//! # async fn demo() -> lab_sweep::error::AppResult<()> {
//! use lab_sweep::config::DeviceConfig;
//! use lab_sweep::device::DeviceRegistry;
//! use lab_sweep::interactive;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(DeviceRegistry::with_builtin_drivers());
//! registry.add_config(DeviceConfig::new("laser", "mock_instrument"))?;
//! interactive::open_device(registry.clone(), "laser").await?;
//! let power = interactive::read(registry, "laser.power").await?;
//! # Ok(())
//! # }
//! ```

use crate::device::{Device, DeviceRegistry};
use crate::element::{Element, Value};
use crate::error::{AppResult, LabError};
use std::sync::Arc;
use tracing::{debug, error};

/// Runs `op` on the blocking pool and logs its failure.
async fn run_blocking<T, F>(operation: &'static str, target: String, op: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    debug!(operation, target = %target, "interactive call");
    let result = tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| LabError::Worker(format!("{operation} {target}: {e}")))
        .and_then(|result| result);

    if let Err(e) = &result {
        error!(operation, target = %target, error = %e, "interactive call failed");
    }
    result
}

/// Opens (or returns the already open) device `name`.
pub async fn open_device(registry: Arc<DeviceRegistry>, name: impl Into<String>) -> AppResult<Arc<Device>> {
    let name = name.into();
    let target = name.clone();
    run_blocking("open", target, move || registry.open(&name)).await
}

/// Reads the variable at `address`.
pub async fn read(registry: Arc<DeviceRegistry>, address: impl Into<String>) -> AppResult<Value> {
    let address = address.into();
    let target = address.clone();
    run_blocking("read", target, move || {
        let variable = variable_at(&registry, &address)?;
        variable.read()
    })
    .await
}

/// Writes `value` to the variable at `address`. Returns the value as written.
pub async fn write(
    registry: Arc<DeviceRegistry>,
    address: impl Into<String>,
    value: Value,
) -> AppResult<Value> {
    let address = address.into();
    let target = address.clone();
    run_blocking("write", target, move || {
        let variable = variable_at(&registry, &address)?;
        variable.write(value)
    })
    .await
}

/// Runs the action at `address`.
pub async fn execute(
    registry: Arc<DeviceRegistry>,
    address: impl Into<String>,
    value: Option<Value>,
) -> AppResult<Option<Value>> {
    let address = address.into();
    let target = address.clone();
    run_blocking("execute", target, move || {
        match registry.resolve(&address)? {
            Element::Action(action) => action.call(value),
            other => Err(LabError::usage(
                other.address(),
                format!("{} is not an action", other.kind()),
            )),
        }
    })
    .await
}

/// Calls the variable or action at `address` like a recipe would: reads a
/// variable without `value`, writes it with one, runs an action.
pub async fn call(
    registry: Arc<DeviceRegistry>,
    address: impl Into<String>,
    value: Option<Value>,
) -> AppResult<Option<Value>> {
    let address = address.into();
    let target = address.clone();
    run_blocking("call", target, move || match registry.resolve(&address)? {
        Element::Variable(variable) => variable.call(value),
        Element::Action(action) => action.call(value),
        Element::Module(module) => Err(LabError::usage(
            module.address(),
            "a module cannot be called",
        )),
    })
    .await
}

fn variable_at(
    registry: &DeviceRegistry,
    address: &str,
) -> AppResult<Arc<crate::element::Variable>> {
    match registry.resolve(address)? {
        Element::Variable(variable) => Ok(variable),
        other => Err(LabError::usage(
            other.address(),
            format!("{} is not a variable", other.kind()),
        )),
    }
}
