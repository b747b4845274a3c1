//! Driver model descriptors.
//!
//! A driver describes what it can do by returning an ordered list of
//! [`Descriptor`]s from [`DriverModelProvider::driver_model`]. The element tree
//! is built from that list once, when the device is opened.
//!
//! # Example
//! ```
//! use lab_sweep::element::{Descriptor, DriverModelProvider, Value, ValueType};
//! use std::sync::Arc;
//!
//! struct Shutter;
//!
//! impl DriverModelProvider for Shutter {
//!     fn driver_model(self: Arc<Self>) -> Vec<Descriptor> {
//!         vec![
//!             Descriptor::variable("opened")
//!                 .value_type(ValueType::Bool)
//!                 .read(|| Ok(Value::Bool(true))),
//!             Descriptor::action("toggle").do_fn(|_| Ok(())),
//!         ]
//!     }
//! }
//! ```

use super::value::{Value, ValueType};
use std::fmt;
use std::sync::Arc;

/// Read callback of a variable.
pub type ReadFn = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;

/// Write callback of a variable. Receives the value coerced to the declared type.
pub type WriteFn = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

/// Callback of an action. Receives `Some` exactly when the action declares a
/// parameter type.
pub type DoFn = Arc<dyn Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync>;

/// Implemented by every driver (and every driver sub-object exposed as a module).
pub trait DriverModelProvider: Send + Sync {
    /// Ordered capability list of this object.
    fn driver_model(self: Arc<Self>) -> Vec<Descriptor>;

    /// Releases the instrument connection. Called once when the device is closed.
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Element kind declared by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// `module`
    Module,
    /// `variable`
    Variable,
    /// `action`
    Action,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElementKind::Module => "module",
            ElementKind::Variable => "variable",
            ElementKind::Action => "action",
        })
    }
}

impl std::str::FromStr for ElementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "module" => Ok(ElementKind::Module),
            "variable" => Ok(ElementKind::Variable),
            "action" => Ok(ElementKind::Action),
            other => Err(format!(
                "element '{other}' is not supported (expected module, variable or action)"
            )),
        }
    }
}

/// Type declared by a descriptor, either already typed or given by name.
#[derive(Debug, Clone)]
pub(crate) enum TypeSpec {
    Known(ValueType),
    Named(String),
}

impl TypeSpec {
    pub(crate) fn resolve(&self) -> Result<ValueType, String> {
        match self {
            TypeSpec::Known(ty) => Ok(*ty),
            TypeSpec::Named(name) => name.parse(),
        }
    }
}

/// One entry of a driver model.
///
/// Fields that do not apply to the declared element kind are ignored when the
/// tree is built; missing required fields are construction errors.
#[derive(Clone)]
pub struct Descriptor {
    pub(crate) name: String,
    pub(crate) element: Result<ElementKind, String>,
    pub(crate) help: Option<String>,
    pub(crate) value_type: Option<TypeSpec>,
    pub(crate) unit: Option<String>,
    pub(crate) read: Option<ReadFn>,
    pub(crate) write: Option<WriteFn>,
    pub(crate) read_init: bool,
    pub(crate) do_fn: Option<DoFn>,
    pub(crate) object: Option<Arc<dyn DriverModelProvider>>,
}

impl Descriptor {
    /// Descriptor with a kind given as text (`"module"`, `"variable"`, `"action"`).
    pub fn new(name: impl Into<String>, element: &str) -> Self {
        Self {
            name: name.into(),
            element: element.parse(),
            help: None,
            value_type: None,
            unit: None,
            read: None,
            write: None,
            read_init: false,
            do_fn: None,
            object: None,
        }
    }

    /// Descriptor of a variable called `name`.
    pub fn variable(name: impl Into<String>) -> Self {
        Self::new(name, "variable")
    }

    /// Descriptor of an action called `name`.
    pub fn action(name: impl Into<String>) -> Self {
        Self::new(name, "action")
    }

    /// Descriptor of a sub-module whose model comes from `object`.
    pub fn module(name: impl Into<String>, object: Arc<dyn DriverModelProvider>) -> Self {
        let mut descriptor = Self::new(name, "module");
        descriptor.object = Some(object);
        descriptor
    }

    /// Variable type, or parameter type of an action.
    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(TypeSpec::Known(value_type));
        self
    }

    /// Same as [`value_type`](Self::value_type) with the type given by name.
    /// Unknown names fail when the tree is built.
    pub fn type_name(mut self, name: impl Into<String>) -> Self {
        self.value_type = Some(TypeSpec::Named(name.into()));
        self
    }

    /// Argument type of an action.
    pub fn param_type(self, value_type: ValueType) -> Self {
        self.value_type(value_type)
    }

    /// Unit of a variable.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Unit of an action argument.
    pub fn param_unit(self, unit: impl Into<String>) -> Self {
        self.unit(unit)
    }

    /// Help text shown by [`Module`](super::Module) and element displays.
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Driver call reading a variable.
    pub fn read<F>(mut self, read: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.read = Some(Arc::new(read));
        self
    }

    /// Driver call writing a variable.
    pub fn write<F>(mut self, write: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.write = Some(Arc::new(write));
        self
    }

    /// Read the variable once when the device is opened.
    pub fn read_init(mut self, enabled: bool) -> Self {
        self.read_init = enabled;
        self
    }

    /// Driver call running an action.
    pub fn do_fn<F>(mut self, do_fn: F) -> Self
    where
        F: Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.do_fn = Some(Arc::new(do_fn));
        self
    }

    /// Driver object providing a sub-module model.
    pub fn object(mut self, object: Arc<dyn DriverModelProvider>) -> Self {
        self.object = Some(object);
        self
    }

    /// Name as given by the driver, before cleaning.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("element", &self.element)
            .field("value_type", &self.value_type)
            .field("readable", &self.read.is_some())
            .field("writable", &self.write.is_some())
            .field("read_init", &self.read_init)
            .finish_non_exhaustive()
    }
}

const RESERVED_CHARACTERS: &[char] = &['*', '.', '"', '/', '\\', '[', ']', ':', ';', '|', ',', ' '];

/// Removes characters that would break dotted addresses or file names.
pub fn clean_name(name: &str) -> String {
    name.chars()
        .filter(|c| !RESERVED_CHARACTERS.contains(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_name_strips_reserved_characters() {
        assert_eq!(clean_name("power.meter [W]"), "powermeterW");
        assert_eq!(clean_name("a*b/c\\d"), "abcd");
        assert_eq!(clean_name(" .,;"), "");
    }

    #[test]
    fn element_kind_parses_known_names_only() {
        assert_eq!("action".parse::<ElementKind>(), Ok(ElementKind::Action));
        assert!("signal".parse::<ElementKind>().is_err());
        assert!(Descriptor::new("x", "signal").element.is_err());
    }

    #[test]
    fn named_types_resolve_lazily() {
        let descriptor = Descriptor::variable("x").type_name("complex");
        let spec = descriptor.value_type.clone().unwrap();
        assert!(spec.resolve().is_err());

        let descriptor = Descriptor::variable("x").type_name("float");
        assert_eq!(descriptor.value_type.unwrap().resolve(), Ok(ValueType::Float));
    }
}
