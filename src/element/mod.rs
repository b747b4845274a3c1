//! Capability tree of an instrument.
//!
//! A device is described by a tree of [`Module`]s holding [`Variable`]s
//! (typed accessors) and [`Action`]s (typed commands). Every node has a dotted
//! address (`laser.shutter.opened`) that stays stable for the lifetime of the
//! device and is the only way callers outside the tree refer to it.
//!
//! All calls into the driver go through the [`DeviceLink`] shared by the
//! elements of one device: it serializes communication with the instrument and
//! publishes an [`ElementEvent`] after every successful call.

pub mod action;
pub mod descriptor;
pub mod module;
pub mod value;
pub mod variable;

pub use action::Action;
pub use descriptor::{clean_name, Descriptor, DriverModelProvider, ElementKind};
pub use module::Module;
pub use value::{Table, Value, ValueType};
pub use variable::Variable;

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Notification published after an element call succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementEvent {
    /// A variable was read
    Read {
        /// Variable address
        address: String,
        /// Value returned by the driver
        value: Value,
    },
    /// A variable was written
    Written {
        /// Variable address
        address: String,
        /// Value handed to the driver, after coercion
        value: Value,
    },
    /// An action ran
    Executed {
        /// Action address
        address: String,
        /// Argument, if the action takes one
        value: Option<Value>,
    },
}

impl ElementEvent {
    /// Address of the element called.
    pub fn address(&self) -> &str {
        match self {
            ElementEvent::Read { address, .. }
            | ElementEvent::Written { address, .. }
            | ElementEvent::Executed { address, .. } => address,
        }
    }
}

/// Communication lock and event channel shared by every element of a device.
#[derive(Debug)]
pub struct DeviceLink {
    device: String,
    lock: Mutex<()>,
    events: broadcast::Sender<ElementEvent>,
}

impl DeviceLink {
    /// Link of the device called `device`.
    pub fn new(device: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            device: device.into(),
            lock: Mutex::new(()),
            events,
        })
    }

    /// Name of the device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Holds the instrument for the duration of one call.
    ///
    /// The lock is not reentrant; driver callbacks must not call back into
    /// elements of the same device.
    pub(crate) fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Receiver of the calls made on the device from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ElementEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: impl FnOnce() -> ElementEvent) {
        if self.events.receiver_count() > 0 {
            // A send error only means every receiver was dropped meanwhile.
            let _ = self.events.send(event());
        }
    }
}

/// Any node of the tree, as returned by [`Module::resolve`].
#[derive(Debug, Clone)]
pub enum Element {
    /// Composite node
    Module(Arc<Module>),
    /// Readable and/or writable value
    Variable(Arc<Variable>),
    /// Command with an optional argument
    Action(Arc<Action>),
}

impl Element {
    /// Kind of the node.
    pub fn kind(&self) -> ElementKind {
        match self {
            Element::Module(_) => ElementKind::Module,
            Element::Variable(_) => ElementKind::Variable,
            Element::Action(_) => ElementKind::Action,
        }
    }

    /// Cleaned name of the node.
    pub fn name(&self) -> &str {
        match self {
            Element::Module(m) => m.name(),
            Element::Variable(v) => v.name(),
            Element::Action(a) => a.name(),
        }
    }

    /// Dotted address of the node.
    pub fn address(&self) -> &str {
        match self {
            Element::Module(m) => m.address(),
            Element::Variable(v) => v.address(),
            Element::Action(a) => a.address(),
        }
    }

    /// The variable, if the node is one.
    pub fn as_variable(&self) -> Option<&Arc<Variable>> {
        match self {
            Element::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// The action, if the node is one.
    pub fn as_action(&self) -> Option<&Arc<Action>> {
        match self {
            Element::Action(a) => Some(a),
            _ => None,
        }
    }

    /// The module, if the node is one.
    pub fn as_module(&self) -> Option<&Arc<Module>> {
        match self {
            Element::Module(m) => Some(m),
            _ => None,
        }
    }
}

/// Joins a parent address and a child name.
pub(crate) fn child_address(parent: Option<&str>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{parent}.{name}"),
        None => name.to_string(),
    }
}
