//! Editable scan configuration.
//!
//! The [`ConfigManager`] owns the [`ScanConfig`] the scanner runs. Every
//! mutation works on a copy that only replaces the current configuration once
//! it is fully valid, so a failed call leaves nothing half-applied. Successful
//! mutations are pushed on a bounded undo/redo history and announced to the
//! change listeners (the scanner clears its datasets from there, since the
//! recipe defines the dataset columns).
//!
//! All mutations are refused with [`LabError::ScanRunning`] unless the shared
//! [`ScanControl`] is idle.

use super::config_file;
use super::range::ScanRange;
use super::recipe::{Parameter, ParameterValues, RecipeKind, RecipeStep, ScanConfig, StepKind};
use super::state::ScanControl;
use crate::device::ElementResolver;
use crate::element::{clean_name, Element, Value, Variable};
use crate::error::{AppResult, LabError};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of undo steps kept.
pub const DEFAULT_HISTORY_DEPTH: usize = 50;

/// Callback run after every configuration change.
pub type ConfigListener = Arc<dyn Fn(&ScanConfig) + Send + Sync>;

// =============================================================================
// History
// =============================================================================

#[derive(Debug)]
struct History {
    snapshots: VecDeque<ScanConfig>,
    index: usize,
    depth: usize,
}

impl History {
    fn new(initial: ScanConfig, depth: usize) -> Self {
        Self {
            snapshots: VecDeque::from([initial]),
            index: 0,
            depth: depth.max(1),
        }
    }

    fn push(&mut self, config: ScanConfig) {
        self.snapshots.truncate(self.index + 1);
        self.snapshots.push_back(config);
        while self.snapshots.len() > self.depth + 1 {
            self.snapshots.pop_front();
        }
        self.index = self.snapshots.len() - 1;
    }

    fn can_undo(&self) -> bool {
        self.index > 0
    }

    fn can_redo(&self) -> bool {
        self.index + 1 < self.snapshots.len()
    }

    fn undo(&mut self) -> Option<ScanConfig> {
        if !self.can_undo() {
            return None;
        }
        self.index -= 1;
        self.snapshots.get(self.index).cloned()
    }

    fn redo(&mut self) -> Option<ScanConfig> {
        if !self.can_redo() {
            return None;
        }
        self.index += 1;
        self.snapshots.get(self.index).cloned()
    }
}

// =============================================================================
// ConfigManager
// =============================================================================

/// Parameters and recipes of the next scan.
pub struct ConfigManager {
    config: ScanConfig,
    control: Arc<ScanControl>,
    history: History,
    listeners: Arc<RwLock<Vec<ConfigListener>>>,
}

impl ConfigManager {
    /// Empty configuration with the default history depth.
    pub fn new(control: Arc<ScanControl>) -> Self {
        Self::with_history_depth(control, DEFAULT_HISTORY_DEPTH)
    }

    /// Empty configuration keeping `depth` undo snapshots.
    pub fn with_history_depth(control: Arc<ScanControl>, depth: usize) -> Self {
        Self {
            config: ScanConfig::default(),
            control,
            history: History::new(ScanConfig::default(), depth),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Scan control consulted before every change.
    pub fn control(&self) -> &Arc<ScanControl> {
        &self.control
    }

    /// Current configuration.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Copy of the current configuration, as handed to a scan.
    pub fn snapshot(&self) -> ScanConfig {
        self.config.clone()
    }

    /// Parameters, slowest first.
    pub fn parameters(&self) -> &[Parameter] {
        &self.config.parameters
    }

    /// Parameter called `name`.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.config.parameters.iter().find(|p| p.name() == name)
    }

    /// Step `name` and the recipe it belongs to.
    pub fn step(&self, name: &str) -> Option<(RecipeKind, &RecipeStep)> {
        [RecipeKind::Init, RecipeKind::Main, RecipeKind::End]
            .into_iter()
            .find_map(|kind| {
                self.config
                    .recipe(kind)
                    .iter()
                    .find(|step| step.name() == name)
                    .map(|step| (kind, step))
            })
    }

    /// Registers a callback run after every change, undo and redo included.
    pub fn on_change(&self, listener: impl Fn(&ScanConfig) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// `base`, or `base_1`, `base_2`, ... if already taken by a parameter or
    /// a step.
    pub fn unique_name(&self, base: &str) -> String {
        unique_name_in(&self.config, &clean_name(base))
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Replaces all parameters by one sweeping `variable`. Returns its name.
    pub fn set_parameter(&mut self, variable: Arc<Variable>, name: Option<&str>) -> AppResult<String> {
        self.edit(|config| {
            config.parameters.clear();
            push_parameter(config, variable, name)
        })
    }

    /// Appends a parameter; it becomes the fastest varying one.
    pub fn add_parameter(&mut self, variable: Arc<Variable>, name: Option<&str>) -> AppResult<String> {
        self.edit(|config| push_parameter(config, variable, name))
    }

    /// Removes the parameter called `name`.
    pub fn remove_parameter(&mut self, name: &str) -> AppResult<()> {
        self.edit(|config| {
            let index = parameter_index(config, name)?;
            config.parameters.remove(index);
            Ok(())
        })
    }

    /// Renames a parameter, returning the unique name it got.
    pub fn rename_parameter(&mut self, name: &str, new_name: &str) -> AppResult<String> {
        self.edit(|config| {
            let index = parameter_index(config, name)?;
            let new_name = checked_name(new_name)?;
            if new_name == name {
                return Ok(new_name);
            }
            let new_name = unique_name_in(config, &new_name);
            config.parameters[index].rename(new_name.clone());
            Ok(new_name)
        })
    }

    /// Replaces the values swept by a parameter.
    pub fn set_parameter_values(&mut self, name: &str, values: ParameterValues) -> AppResult<()> {
        self.edit(|config| {
            let index = parameter_index(config, name)?;
            config.parameters[index].set_values(values)
        })
    }

    /// Switches the parameter to `range`.
    pub fn set_range(&mut self, name: &str, range: ScanRange) -> AppResult<()> {
        self.set_parameter_values(name, ParameterValues::Range(range))
    }

    /// Sets the number of points of a range parameter.
    pub fn set_nbpts(&mut self, name: &str, nbpts: usize) -> AppResult<()> {
        self.edit_range(name, |range| {
            range.nbpts = nbpts;
            Ok(())
        })
    }

    /// Sets the number of points so that they are about `step` apart.
    pub fn set_step(&mut self, name: &str, step: f64) -> AppResult<()> {
        self.edit_range(name, |range| {
            *range = range.with_step(step)?;
            Ok(())
        })
    }

    /// Switches a range parameter between linear and log spacing.
    pub fn set_log(&mut self, name: &str, log: bool) -> AppResult<()> {
        self.edit_range(name, |range| {
            range.log = log;
            Ok(())
        })
    }

    fn edit_range(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut ScanRange) -> Result<(), String>,
    ) -> AppResult<()> {
        self.edit(|config| {
            let index = parameter_index(config, name)?;
            let parameter = &mut config.parameters[index];
            let mut range = *parameter.range().ok_or_else(|| {
                LabError::usage(parameter.address(), "parameter sweeps an explicit list")
            })?;
            f(&mut range).map_err(|message| LabError::usage(parameter.address(), message))?;
            parameter.set_values(ParameterValues::Range(range))
        })
    }

    // =========================================================================
    // Recipes
    // =========================================================================

    /// Appends a step to the main recipe. Returns the step name.
    pub fn add_recipe_step(
        &mut self,
        kind: StepKind,
        element: Option<Element>,
        name: Option<&str>,
        value: Option<Value>,
    ) -> AppResult<String> {
        self.add_step(RecipeKind::Main, kind, element, name, value)
    }

    /// Appends a step to one of the three recipes.
    ///
    /// Without `name`, the step is named after its element (`wait` for
    /// delays), suffixed if needed.
    pub fn add_step(
        &mut self,
        recipe: RecipeKind,
        kind: StepKind,
        element: Option<Element>,
        name: Option<&str>,
        value: Option<Value>,
    ) -> AppResult<String> {
        self.edit(|config| {
            let base = match (name, &element) {
                (Some(name), _) => checked_name(name)?,
                (None, Some(element)) => element.name().to_string(),
                (None, None) => StepKind::Wait.as_str().to_string(),
            };
            let name = unique_name_in(config, &base);
            let step = RecipeStep::new(name.clone(), kind, element, value)?;
            config.recipe_mut(recipe).push(step);
            Ok(name)
        })
    }

    /// Removes step `name` from whichever recipe holds it.
    pub fn remove_recipe_step(&mut self, name: &str) -> AppResult<()> {
        self.edit(|config| {
            let (kind, index) = step_index(config, name)?;
            config.recipe_mut(kind).remove(index);
            Ok(())
        })
    }

    /// Renames a step; the new name is suffixed if already taken.
    pub fn rename_recipe_step(&mut self, name: &str, new_name: &str) -> AppResult<String> {
        self.edit(|config| {
            let (kind, index) = step_index(config, name)?;
            let new_name = checked_name(new_name)?;
            if new_name == name {
                return Ok(new_name);
            }
            let new_name = unique_name_in(config, &new_name);
            config.recipe_mut(kind)[index].rename(new_name.clone());
            Ok(new_name)
        })
    }

    /// Changes the value of a `set`, `execute` or `wait` step.
    pub fn set_recipe_step_value(&mut self, name: &str, value: Value) -> AppResult<()> {
        self.edit(|config| {
            let (kind, index) = step_index(config, name)?;
            let steps = config.recipe_mut(kind);
            steps[index] = steps[index].with_value(value)?;
            Ok(())
        })
    }

    /// Reorders the main recipe. `names` must list each of its steps once.
    pub fn set_recipe_order(&mut self, names: &[&str]) -> AppResult<()> {
        self.set_order(RecipeKind::Main, names)
    }

    /// Reorders the steps of `recipe`; `names` must list every step once.
    pub fn set_order(&mut self, recipe: RecipeKind, names: &[&str]) -> AppResult<()> {
        self.edit(|config| {
            let steps = config.recipe_mut(recipe);
            let mut current: Vec<Option<RecipeStep>> = steps.drain(..).map(Some).collect();
            let mut ordered = Vec::with_capacity(current.len());
            for name in names {
                let slot = current
                    .iter_mut()
                    .find(|slot| slot.as_ref().is_some_and(|s| s.name() == *name))
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        LabError::Recipe(format!(
                            "'{name}' is not a step of {} or is listed twice",
                            recipe.section()
                        ))
                    })?;
                ordered.push(slot);
            }
            if let Some(missing) = current.iter().flatten().next() {
                return Err(LabError::Recipe(format!(
                    "new order of {} leaves out '{}'",
                    recipe.section(),
                    missing.name()
                )));
            }
            *steps = ordered;
            Ok(())
        })
    }

    /// Removes every parameter and step.
    pub fn clear(&mut self) -> AppResult<()> {
        self.edit(|config| {
            *config = ScanConfig::default();
            Ok(())
        })
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Whether a change can be undone.
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    /// Whether an undone change can be redone.
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Restores the previous configuration. Returns `false` if there is none.
    pub fn undo(&mut self) -> AppResult<bool> {
        self.control.ensure_idle()?;
        match self.history.undo() {
            Some(config) => {
                debug!("configuration undo");
                self.replace(config);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-applies the last undone change. Returns `false` if there is none.
    pub fn redo(&mut self) -> AppResult<bool> {
        self.control.ensure_idle()?;
        match self.history.redo() {
            Some(config) => {
                debug!("configuration redo");
                self.replace(config);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Config files
    // =========================================================================

    /// Configuration in config file form.
    pub fn to_config_string(&self) -> AppResult<String> {
        config_file::to_config_string(&self.config)
    }

    /// Writes the configuration to `path`.
    pub fn export(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        config_file::export(&self.config, path)?;
        info!(path = %path.display(), "configuration exported");
        Ok(())
    }

    /// Loads a configuration file, resolving every address with `resolver`.
    ///
    /// The current configuration is replaced only if the whole file resolves.
    pub fn import(&mut self, path: impl AsRef<Path>, resolver: &dyn ElementResolver) -> AppResult<()> {
        self.control.ensure_idle()?;
        let path = path.as_ref();
        let config = config_file::import(path, resolver)?;
        self.commit(config);
        info!(path = %path.display(), "configuration imported");
        Ok(())
    }

    /// Replaces the configuration with the one in `text`, all or nothing.
    pub fn import_str(&mut self, text: &str, resolver: &dyn ElementResolver) -> AppResult<()> {
        self.control.ensure_idle()?;
        let config = config_file::from_config_str(text, resolver, "<string>")?;
        self.commit(config);
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Applies `f` to a copy of the configuration and commits it on success.
    fn edit<T>(&mut self, f: impl FnOnce(&mut ScanConfig) -> AppResult<T>) -> AppResult<T> {
        self.control.ensure_idle()?;
        let mut config = self.config.clone();
        let result = f(&mut config)?;
        if config != self.config {
            self.commit(config);
        }
        Ok(result)
    }

    fn commit(&mut self, config: ScanConfig) {
        self.history.push(config.clone());
        self.replace(config);
    }

    fn replace(&mut self, config: ScanConfig) {
        self.config = config;
        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            listener(&self.config);
        }
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &self.config)
            .field("state", &self.control.state())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

fn checked_name(name: &str) -> AppResult<String> {
    let cleaned = clean_name(name);
    if cleaned.is_empty() {
        return Err(LabError::Recipe(format!(
            "'{name}' is empty after removing reserved characters"
        )));
    }
    Ok(cleaned)
}

fn unique_name_in(config: &ScanConfig, base: &str) -> String {
    let names = config.names();
    if !names.contains(&base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}_{i}"))
        .find(|candidate| !names.contains(&candidate.as_str()))
        .unwrap_or_else(|| base.to_string())
}

fn push_parameter(
    config: &mut ScanConfig,
    variable: Arc<Variable>,
    name: Option<&str>,
) -> AppResult<String> {
    let base = match name {
        Some(name) => checked_name(name)?,
        None => variable.name().to_string(),
    };
    let name = unique_name_in(config, &base);
    config.parameters.push(Parameter::new(name.clone(), variable)?);
    Ok(name)
}

fn parameter_index(config: &ScanConfig, name: &str) -> AppResult<usize> {
    config
        .parameters
        .iter()
        .position(|p| p.name() == name)
        .ok_or_else(|| LabError::Recipe(format!("no parameter named '{name}'")))
}

fn step_index(config: &ScanConfig, name: &str) -> AppResult<(RecipeKind, usize)> {
    [RecipeKind::Init, RecipeKind::Main, RecipeKind::End]
        .into_iter()
        .find_map(|kind| {
            config
                .recipe(kind)
                .iter()
                .position(|step| step.name() == name)
                .map(|index| (kind, index))
        })
        .ok_or_else(|| LabError::Recipe(format!("no recipe step named '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{DeviceLink, Module};
    use crate::hardware::mock::MockInstrument;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instrument() -> Module {
        let link = DeviceLink::new("dev");
        Module::build("dev", Arc::new(MockInstrument::new()), &link).unwrap()
    }

    fn manager() -> ConfigManager {
        ConfigManager::new(ScanControl::new())
    }

    #[test]
    fn test_unique_names() {
        let dev = instrument();
        let amplitude = dev.get_variable("amplitude").unwrap();
        let mut manager = manager();

        assert_eq!(manager.set_parameter(amplitude.clone(), None).unwrap(), "amplitude");
        let first = manager
            .add_recipe_step(StepKind::Measure, Some(Element::Variable(amplitude.clone())), None, None)
            .unwrap();
        let second = manager
            .add_recipe_step(StepKind::Measure, Some(Element::Variable(amplitude)), None, None)
            .unwrap();
        assert_eq!(first, "amplitude_1");
        assert_eq!(second, "amplitude_2");
        assert_eq!(manager.unique_name("amplitude"), "amplitude_3");
        assert_eq!(manager.unique_name("power"), "power");
    }

    #[test]
    fn test_failed_step_leaves_config_untouched() {
        let dev = instrument();
        let power = dev.get_variable("power").unwrap();
        let mut manager = manager();

        let err = manager
            .add_recipe_step(StepKind::Set, Some(Element::Variable(power)), None, Some(Value::Float(1.0)))
            .unwrap_err();
        assert!(matches!(err, LabError::Usage { .. }));
        assert!(manager.config().recipe.is_empty());
        assert!(!manager.can_undo());
    }

    #[test]
    fn test_rename_and_order() {
        let dev = instrument();
        let mut manager = manager();
        for name in ["power", "label", "amplitude"] {
            manager
                .add_recipe_step(StepKind::Measure, Some(dev.resolve(name).unwrap()), None, None)
                .unwrap();
        }
        assert_eq!(manager.rename_recipe_step("label", "power").unwrap(), "power_1");

        manager.set_recipe_order(&["amplitude", "power_1", "power"]).unwrap();
        let names: Vec<_> = manager.config().recipe.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["amplitude", "power_1", "power"]);

        assert!(manager.set_recipe_order(&["amplitude", "power"]).is_err());
        assert!(manager.set_recipe_order(&["amplitude", "amplitude", "power"]).is_err());
    }

    #[test]
    fn test_range_helpers() {
        let dev = instrument();
        let mut manager = manager();
        let name = manager
            .set_parameter(dev.get_variable("amplitude").unwrap(), Some("amp"))
            .unwrap();

        manager.set_range(&name, ScanRange::linear(0.0, 4.0, 3)).unwrap();
        manager.set_step(&name, 0.5).unwrap();
        assert_eq!(manager.parameter("amp").unwrap().range().unwrap().nbpts, 9);
        manager.set_nbpts(&name, 2).unwrap();
        assert!(manager.set_nbpts(&name, 0).is_err());
        assert!(manager.set_nbpts(&name, crate::experiment::range::MAX_POINTS + 1).is_err());
        assert!(manager.set_step(&name, 1e-300).is_err());
        assert_eq!(manager.parameter("amp").unwrap().range().unwrap().nbpts, 2);

        manager
            .set_parameter_values(&name, ParameterValues::List(vec![Value::Float(1.0)]))
            .unwrap();
        assert!(manager.set_log(&name, true).is_err());
    }

    #[test]
    fn test_undo_redo() {
        let dev = instrument();
        let mut manager = manager();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        manager.on_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .add_recipe_step(StepKind::Measure, Some(dev.resolve("power").unwrap()), None, None)
            .unwrap();
        manager.add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(0.1))).unwrap();
        assert_eq!(manager.config().recipe.len(), 2);

        assert!(manager.undo().unwrap());
        assert_eq!(manager.config().recipe.len(), 1);
        assert!(manager.redo().unwrap());
        assert_eq!(manager.config().recipe.len(), 2);
        assert!(!manager.redo().unwrap());

        manager.undo().unwrap();
        manager.remove_recipe_step("power").unwrap();
        assert!(!manager.can_redo());
        assert!(manager.config().recipe.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_history_depth() {
        let mut manager = ConfigManager::with_history_depth(ScanControl::new(), 2);
        for _ in 0..4 {
            manager.add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(0.0))).unwrap();
        }
        assert!(manager.undo().unwrap());
        assert!(manager.undo().unwrap());
        assert!(!manager.undo().unwrap());
        assert_eq!(manager.config().recipe.len(), 2);
    }

    #[test]
    fn test_mutation_rejected_while_armed() {
        let control = ScanControl::new();
        let mut manager = ConfigManager::new(control.clone());
        control.arm().unwrap();
        let err = manager
            .add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(1.0)))
            .unwrap_err();
        assert!(matches!(err, LabError::ScanRunning));
        assert!(matches!(manager.undo(), Err(LabError::ScanRunning)));
        control.finish();
        assert!(manager
            .add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(1.0)))
            .is_ok());
    }
}
