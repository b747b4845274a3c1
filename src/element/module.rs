//! Module elements: the named branches of a device tree.

use super::action::{Action, ActionParts};
use super::descriptor::{clean_name, Descriptor, DriverModelProvider, ElementKind};
use super::variable::{Variable, VariableParts};
use super::{child_address, DeviceLink, Element};
use crate::error::{AppResult, LabError};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Composite node grouping submodules, variables and actions.
///
/// Names are unique across the three maps of one module; insertion order is
/// the order of the driver model.
pub struct Module {
    name: String,
    address: String,
    help: Option<String>,
    modules: IndexMap<String, Arc<Module>>,
    variables: IndexMap<String, Arc<Variable>>,
    actions: IndexMap<String, Arc<Action>>,
}

impl Module {
    /// Builds the tree of `provider` as a root module named `name`.
    ///
    /// Fails on the first malformed descriptor; no partial tree is returned.
    pub fn build(
        name: &str,
        provider: Arc<dyn DriverModelProvider>,
        link: &Arc<DeviceLink>,
    ) -> AppResult<Self> {
        let cleaned = clean_name(name);
        if cleaned.is_empty() {
            return Err(LabError::configuration(
                name,
                "module name is empty after removing reserved characters",
            ));
        }
        Self::from_descriptors(&cleaned, None, None, provider.driver_model(), link)
    }

    /// Builds a module from an explicit descriptor list.
    pub fn from_descriptors(
        name: &str,
        parent: Option<&str>,
        help: Option<String>,
        descriptors: Vec<Descriptor>,
        link: &Arc<DeviceLink>,
    ) -> AppResult<Self> {
        let mut module = Module {
            name: name.to_string(),
            address: child_address(parent, name),
            help,
            modules: IndexMap::new(),
            variables: IndexMap::new(),
            actions: IndexMap::new(),
        };

        for descriptor in descriptors {
            module.add(descriptor, link)?;
        }
        Ok(module)
    }

    fn add(&mut self, descriptor: Descriptor, link: &Arc<DeviceLink>) -> AppResult<()> {
        let name = clean_name(&descriptor.name);
        if name.is_empty() {
            return Err(LabError::configuration(
                &self.address,
                format!(
                    "descriptor name '{}' is empty after removing reserved characters",
                    descriptor.name
                ),
            ));
        }
        let address = child_address(Some(&self.address), &name);

        if self.contains(&name) {
            return Err(LabError::configuration(
                address,
                format!("name '{name}' is already used in module '{}'", self.address),
            ));
        }

        let kind = descriptor
            .element
            .clone()
            .map_err(|message| LabError::configuration(&address, message))?;

        match kind {
            ElementKind::Variable => {
                let value_type = descriptor
                    .value_type
                    .as_ref()
                    .ok_or_else(|| LabError::configuration(&address, "variable needs a type"))?
                    .resolve()
                    .map_err(|message| LabError::configuration(&address, message))?;
                let variable = Variable::new(
                    VariableParts {
                        name: name.clone(),
                        address,
                        value_type,
                        unit: descriptor.unit,
                        help: descriptor.help,
                        read_fn: descriptor.read,
                        write_fn: descriptor.write,
                        read_init: descriptor.read_init,
                    },
                    link.clone(),
                )?;
                self.variables.insert(name, Arc::new(variable));
            }
            ElementKind::Action => {
                let do_fn = descriptor
                    .do_fn
                    .ok_or_else(|| LabError::configuration(&address, "action needs a do function"))?;
                let param_type = descriptor
                    .value_type
                    .as_ref()
                    .map(|spec| spec.resolve())
                    .transpose()
                    .map_err(|message| LabError::configuration(&address, message))?;
                let action = Action::new(
                    ActionParts {
                        name: name.clone(),
                        address,
                        param_type,
                        param_unit: descriptor.unit,
                        help: descriptor.help,
                        do_fn,
                    },
                    link.clone(),
                );
                self.actions.insert(name, Arc::new(action));
            }
            ElementKind::Module => {
                let object = descriptor.object.ok_or_else(|| {
                    LabError::configuration(&address, "module needs a driver object")
                })?;
                let module = Module::from_descriptors(
                    &name,
                    Some(&self.address),
                    descriptor.help,
                    object.driver_model(),
                    link,
                )?;
                self.modules.insert(name, Arc::new(module));
            }
        }
        Ok(())
    }

    /// Cleaned name of the module.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted address of the module.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Help text from the driver.
    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
            || self.variables.contains_key(name)
            || self.actions.contains_key(name)
    }

    /// Direct sub-module called `name`.
    pub fn get_module(&self, name: &str) -> AppResult<Arc<Module>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::not_found(child_address(Some(&self.address), name)))
    }

    /// Direct variable called `name`.
    pub fn get_variable(&self, name: &str) -> AppResult<Arc<Variable>> {
        self.variables
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::not_found(child_address(Some(&self.address), name)))
    }

    /// Direct action called `name`.
    pub fn get_action(&self, name: &str) -> AppResult<Arc<Action>> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::not_found(child_address(Some(&self.address), name)))
    }

    /// Looks a direct child up in the three capability maps.
    pub fn resolve(&self, name: &str) -> AppResult<Element> {
        if let Some(module) = self.modules.get(name) {
            return Ok(Element::Module(module.clone()));
        }
        if let Some(variable) = self.variables.get(name) {
            return Ok(Element::Variable(variable.clone()));
        }
        if let Some(action) = self.actions.get(name) {
            return Ok(Element::Action(action.clone()));
        }
        Err(LabError::not_found(child_address(Some(&self.address), name)))
    }

    /// Follows a dotted path relative to this module (`"sub.power"`).
    pub fn resolve_path(&self, path: &str) -> AppResult<Element> {
        let mut parts = path.split('.');
        let first = parts.next().unwrap_or_default();
        let mut current = self.resolve(first)?;
        for part in parts {
            current = match &current {
                Element::Module(module) => module.resolve(part)?,
                other => {
                    return Err(LabError::not_found(child_address(
                        Some(other.address()),
                        part,
                    )))
                }
            };
        }
        Ok(current)
    }

    /// Names of the direct sub-modules, in driver order.
    pub fn list_modules(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    /// Names of the direct variables, in driver order.
    pub fn list_variables(&self) -> Vec<&str> {
        self.variables.keys().map(String::as_str).collect()
    }

    /// Names of the direct actions, in driver order.
    pub fn list_actions(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Direct sub-modules.
    pub fn modules(&self) -> impl Iterator<Item = &Arc<Module>> {
        self.modules.values()
    }

    /// Direct variables.
    pub fn variables(&self) -> impl Iterator<Item = &Arc<Variable>> {
        self.variables.values()
    }

    /// Direct actions.
    pub fn actions(&self) -> impl Iterator<Item = &Arc<Action>> {
        self.actions.values()
    }

    /// Every `(address, kind)` below this module, depth first.
    pub fn structure(&self) -> Vec<(String, ElementKind)> {
        let mut out = Vec::new();
        self.collect_structure(&mut out);
        out
    }

    fn collect_structure(&self, out: &mut Vec<(String, ElementKind)>) {
        for module in self.modules.values() {
            out.push((module.address.clone(), ElementKind::Module));
            module.collect_structure(out);
        }
        for variable in self.variables.values() {
            out.push((variable.address().to_string(), ElementKind::Variable));
        }
        for action in self.actions.values() {
            out.push((action.address().to_string(), ElementKind::Action));
        }
    }

    /// `(name, kind, depth)` of this module and everything below it.
    pub fn hierarchy(&self) -> Vec<(String, ElementKind, usize)> {
        let mut out = vec![(self.name.clone(), ElementKind::Module, 0)];
        self.collect_hierarchy(1, &mut out);
        out
    }

    fn collect_hierarchy(&self, depth: usize, out: &mut Vec<(String, ElementKind, usize)>) {
        for module in self.modules.values() {
            out.push((module.name.clone(), ElementKind::Module, depth));
            module.collect_hierarchy(depth + 1, out);
        }
        for variable in self.variables.values() {
            out.push((variable.name().to_string(), ElementKind::Variable, depth));
        }
        for action in self.actions.values() {
            out.push((action.name().to_string(), ElementKind::Action, depth));
        }
    }

    /// Variables flagged to be read when the device is opened.
    pub fn read_init_variables(&self) -> Vec<Arc<Variable>> {
        let mut out: Vec<_> = self
            .variables
            .values()
            .filter(|v| v.read_init())
            .cloned()
            .collect();
        for module in self.modules.values() {
            out.extend(module.read_init_variables());
        }
        out
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("address", &self.address)
            .field("modules", &self.list_modules())
            .field("variables", &self.list_variables())
            .field("actions", &self.list_actions())
            .finish()
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module: {}", self.address)?;
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        if !self.modules.is_empty() {
            write!(f, "\n  modules: {}", self.list_modules().join(", "))?;
        }
        if !self.variables.is_empty() {
            write!(f, "\n  variables: {}", self.list_variables().join(", "))?;
        }
        if !self.actions.is_empty() {
            write!(f, "\n  actions: {}", self.list_actions().join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Value, ValueType};

    struct Axis;

    impl DriverModelProvider for Axis {
        fn driver_model(self: Arc<Self>) -> Vec<Descriptor> {
            vec![
                Descriptor::variable("position")
                    .value_type(ValueType::Float)
                    .read(|| Ok(Value::Float(0.0)))
                    .write(|_| Ok(()))
                    .read_init(true),
                Descriptor::action("home").do_fn(|_| Ok(())),
            ]
        }
    }

    struct Stage {
        model: Vec<Descriptor>,
    }

    impl DriverModelProvider for Stage {
        fn driver_model(self: Arc<Self>) -> Vec<Descriptor> {
            self.model.clone()
        }
    }

    fn build(model: Vec<Descriptor>) -> AppResult<Module> {
        Module::build("stage", Arc::new(Stage { model }), &DeviceLink::new("stage"))
    }

    #[test]
    fn addresses_follow_the_tree() {
        let module = build(vec![
            Descriptor::module("x", Arc::new(Axis)),
            Descriptor::variable("temp")
                .value_type(ValueType::Float)
                .read(|| Ok(Value::Float(21.0))),
        ])
        .unwrap();

        assert_eq!(module.address(), "stage");
        assert_eq!(module.get_variable("temp").unwrap().address(), "stage.temp");
        let x = module.get_module("x").unwrap();
        assert_eq!(x.get_action("home").unwrap().address(), "stage.x.home");
        assert_eq!(
            module.resolve_path("x.position").unwrap().address(),
            "stage.x.position"
        );
        assert_eq!(module.read_init_variables().len(), 1);
    }

    #[test]
    fn duplicate_names_fail_the_build() {
        let err = build(vec![
            Descriptor::variable("a")
                .value_type(ValueType::Int)
                .read(|| Ok(Value::Int(1))),
            Descriptor::action("a").do_fn(|_| Ok(())),
        ])
        .unwrap_err();
        assert!(matches!(err, LabError::Configuration { .. }));
        assert_eq!(err.address(), Some("stage.a"));
    }

    #[test]
    fn malformed_descriptors_fail_the_build() {
        let missing_type = build(vec![Descriptor::variable("a").read(|| Ok(Value::Int(1)))]);
        assert!(missing_type.is_err());

        let unknown_type = build(vec![Descriptor::variable("a")
            .type_name("complex")
            .read(|| Ok(Value::Int(1)))]);
        assert!(unknown_type.is_err());

        let no_accessor = build(vec![Descriptor::variable("a").value_type(ValueType::Int)]);
        assert!(no_accessor.is_err());

        let no_do = build(vec![Descriptor::action("go")]);
        assert!(no_do.is_err());

        let no_object = build(vec![Descriptor::new("sub", "module")]);
        assert!(no_object.is_err());

        let bad_kind = build(vec![Descriptor::new("sub", "widget")]);
        assert!(bad_kind.is_err());

        let empty_name = build(vec![Descriptor::action("..").do_fn(|_| Ok(()))]);
        assert!(empty_name.is_err());
    }

    #[test]
    fn missing_elements_report_full_address() {
        let module = build(vec![Descriptor::module("x", Arc::new(Axis))]).unwrap();
        let err = module.resolve_path("x.speed").unwrap_err();
        assert_eq!(err.address(), Some("stage.x.speed"));
        assert!(module.resolve_path("x.position.deeper").is_err());
    }

    #[test]
    fn hierarchy_reports_depth() {
        let module = build(vec![Descriptor::module("x", Arc::new(Axis))]).unwrap();
        let hierarchy = module.hierarchy();
        assert_eq!(hierarchy[0], ("stage".to_string(), ElementKind::Module, 0));
        assert_eq!(hierarchy[1], ("x".to_string(), ElementKind::Module, 1));
        assert_eq!(hierarchy[2], ("position".to_string(), ElementKind::Variable, 2));
        assert_eq!(module.structure().len(), 3);
        assert!(module.to_string().contains("modules: x"));
    }
}
