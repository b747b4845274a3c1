//! Action elements: driver calls taking at most one argument.

use super::descriptor::DoFn;
use super::{DeviceLink, ElementEvent, Value, ValueType};
use crate::error::{AppResult, LabError};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Command exposed by a driver, with zero or one typed argument.
pub struct Action {
    name: String,
    address: String,
    param_type: Option<ValueType>,
    param_unit: Option<String>,
    help: Option<String>,
    do_fn: DoFn,
    link: Arc<DeviceLink>,
}

pub(crate) struct ActionParts {
    pub name: String,
    pub address: String,
    pub param_type: Option<ValueType>,
    pub param_unit: Option<String>,
    pub help: Option<String>,
    pub do_fn: DoFn,
}

impl Action {
    pub(crate) fn new(parts: ActionParts, link: Arc<DeviceLink>) -> Self {
        Self {
            name: parts.name,
            address: parts.address,
            param_type: parts.param_type,
            param_unit: parts.param_unit,
            help: parts.help,
            do_fn: parts.do_fn,
            link,
        }
    }

    /// Cleaned name of the action.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted address of the action.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Argument type, if the action takes one.
    pub fn param_type(&self) -> Option<ValueType> {
        self.param_type
    }

    /// Unit of the argument.
    pub fn param_unit(&self) -> Option<&str> {
        self.param_unit.as_deref()
    }

    /// Help text from the driver.
    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    /// Whether the action takes an argument.
    pub fn has_parameter(&self) -> bool {
        self.param_type.is_some()
    }

    /// Runs the action. `value` must be given exactly when the action has a
    /// parameter; it is coerced to the parameter type.
    ///
    /// Returns the coerced argument, if any.
    pub fn call(&self, value: Option<Value>) -> AppResult<Option<Value>> {
        let argument = self.coerce(value)?;

        {
            let _guard = self.link.acquire();
            (self.do_fn)(argument.clone()).map_err(|source| LabError::Communication {
                address: self.address.clone(),
                source,
            })?;
        }

        debug!(address = %self.address, "action executed");
        self.link.publish(|| ElementEvent::Executed {
            address: self.address.clone(),
            value: argument.clone(),
        });
        Ok(argument)
    }

    /// Checks an argument without running the action.
    pub fn coerce(&self, value: Option<Value>) -> AppResult<Option<Value>> {
        match (self.param_type, value) {
            (Some(ty), Some(value)) => value
                .coerce(ty)
                .map(Some)
                .map_err(|message| LabError::usage(&self.address, message)),
            (None, None) => Ok(None),
            (Some(ty), None) => Err(LabError::usage(
                &self.address,
                format!("action needs a {ty} argument"),
            )),
            (None, Some(_)) => Err(LabError::usage(&self.address, "action takes no argument")),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("address", &self.address)
            .field("param_type", &self.param_type)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action: {}", self.address)?;
        if let Some(ty) = self.param_type {
            write!(f, "\n  parameter: {ty}")?;
            if let Some(unit) = &self.param_unit {
                write!(f, " ({unit})")?;
            }
        }
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}
