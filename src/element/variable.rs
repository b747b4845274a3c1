//! Variable elements: typed values read or written through the driver.

use super::descriptor::{ReadFn, WriteFn};
use super::{DeviceLink, ElementEvent, Value, ValueType};
use crate::error::{AppResult, LabError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Typed accessor exposed by a driver.
///
/// At least one of the read and write callbacks is present. The declared type
/// never changes after construction.
pub struct Variable {
    name: String,
    address: String,
    value_type: ValueType,
    unit: Option<String>,
    help: Option<String>,
    read_fn: Option<ReadFn>,
    write_fn: Option<WriteFn>,
    read_init: bool,
    last_value: Mutex<Option<Value>>,
    link: Arc<DeviceLink>,
}

pub(crate) struct VariableParts {
    pub name: String,
    pub address: String,
    pub value_type: ValueType,
    pub unit: Option<String>,
    pub help: Option<String>,
    pub read_fn: Option<ReadFn>,
    pub write_fn: Option<WriteFn>,
    pub read_init: bool,
}

impl Variable {
    pub(crate) fn new(parts: VariableParts, link: Arc<DeviceLink>) -> AppResult<Self> {
        if parts.read_fn.is_none() && parts.write_fn.is_none() {
            return Err(LabError::configuration(
                parts.address,
                "a variable needs a read or a write function",
            ));
        }
        Ok(Self {
            name: parts.name,
            address: parts.address,
            value_type: parts.value_type,
            unit: parts.unit,
            help: parts.help,
            read_fn: parts.read_fn,
            write_fn: parts.write_fn,
            read_init: parts.read_init,
            last_value: Mutex::new(None),
            link,
        })
    }

    /// Cleaned name of the variable.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted address of the variable.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Declared type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Unit from the driver.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Help text from the driver.
    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    /// Whether the driver can read the variable.
    pub fn readable(&self) -> bool {
        self.read_fn.is_some()
    }

    /// Whether the driver can write the variable.
    pub fn writable(&self) -> bool {
        self.write_fn.is_some()
    }

    /// Whether the declared type is int or float.
    pub fn numerical(&self) -> bool {
        self.value_type.is_numerical()
    }

    /// Whether the variable is read when its device opens.
    pub fn read_init(&self) -> bool {
        self.read_init
    }

    /// Last value read, kept only for array and table variables.
    pub fn last_value(&self) -> Option<Value> {
        self.last_value.lock().clone()
    }

    /// Reads when `value` is `None`, writes otherwise.
    ///
    /// Returns the read value, or `None` after a successful write.
    pub fn call(&self, value: Option<Value>) -> AppResult<Option<Value>> {
        match value {
            None => self.read().map(Some),
            Some(value) => self.write(value).map(|_| None),
        }
    }

    /// Reads through the driver, coercing the result to the declared type.
    pub fn read(&self) -> AppResult<Value> {
        let read_fn = self
            .read_fn
            .as_ref()
            .ok_or_else(|| LabError::usage(&self.address, "variable is not readable"))?;

        let value = {
            let _guard = self.link.acquire();
            read_fn().map_err(|source| LabError::Communication {
                address: self.address.clone(),
                source,
            })?
        };
        let value = value
            .coerce(self.value_type)
            .map_err(|message| LabError::Communication {
                address: self.address.clone(),
                source: anyhow::anyhow!("driver returned an unexpected value: {message}"),
            })?;

        if self.value_type.is_cached() {
            *self.last_value.lock() = Some(value.clone());
        }
        debug!(address = %self.address, "variable read");
        self.link.publish(|| ElementEvent::Read {
            address: self.address.clone(),
            value: value.clone(),
        });
        Ok(value)
    }

    /// Coerces `value` to the declared type and hands it to the driver.
    ///
    /// Returns the coerced value that was written.
    pub fn write(&self, value: Value) -> AppResult<Value> {
        let write_fn = self
            .write_fn
            .as_ref()
            .ok_or_else(|| LabError::usage(&self.address, "variable is not writable"))?;
        let value = self.coerce(value)?;

        {
            let _guard = self.link.acquire();
            write_fn(value.clone()).map_err(|source| LabError::Communication {
                address: self.address.clone(),
                source,
            })?;
        }

        debug!(address = %self.address, value = %value, "variable written");
        self.link.publish(|| ElementEvent::Written {
            address: self.address.clone(),
            value: value.clone(),
        });
        Ok(value)
    }

    /// Converts `value` to the declared type without touching the driver.
    pub fn coerce(&self, value: Value) -> AppResult<Value> {
        value
            .coerce(self.value_type)
            .map_err(|message| LabError::usage(&self.address, message))
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("address", &self.address)
            .field("value_type", &self.value_type)
            .field("readable", &self.readable())
            .field("writable", &self.writable())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Variable: {}", self.address)?;
        writeln!(f, "  readable: {}", self.readable())?;
        writeln!(f, "  writable: {}", self.writable())?;
        write!(f, "  type: {}", self.value_type)?;
        if let Some(unit) = &self.unit {
            write!(f, "\n  unit: {unit}")?;
        }
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}
