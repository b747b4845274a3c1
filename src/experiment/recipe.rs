//! Parameters, recipe steps and the scan configuration they form.

use super::range::{ScanRange, MAX_POINTS};
use crate::element::{Action, Element, Value, ValueType, Variable};
use crate::error::{AppResult, LabError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Kind of a recipe step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Read a variable and record the value
    Measure,
    /// Write a value to a variable and record it
    Set,
    /// Run an action, recording its argument if it has one
    Execute,
    /// Sleep for a number of seconds
    Wait,
}

impl StepKind {
    /// Name shown to users.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Measure => "measure",
            StepKind::Set => "set",
            StepKind::Execute => "execute",
            StepKind::Wait => "wait",
        }
    }

    /// Spelling used in config files; executions are stored as `action`.
    pub fn file_name(&self) -> &'static str {
        match self {
            StepKind::Execute => "action",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "measure" => Ok(StepKind::Measure),
            "set" => Ok(StepKind::Set),
            "action" | "execute" => Ok(StepKind::Execute),
            "wait" => Ok(StepKind::Wait),
            other => Err(format!("unknown step type '{other}'")),
        }
    }
}

/// One of the three recipes of a scan configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipeKind {
    /// Run once before the first point
    Init,
    /// Run at every point
    Main,
    /// Run once after the last point
    End,
}

impl RecipeKind {
    /// Config file section of the recipe.
    pub fn section(&self) -> &'static str {
        match self {
            RecipeKind::Init => "init_recipe",
            RecipeKind::Main => "recipe",
            RecipeKind::End => "end_recipe",
        }
    }
}

// =============================================================================
// Steps
// =============================================================================

/// What a step does, with its target element and value.
#[derive(Debug, Clone)]
pub enum StepAction {
    /// Read the variable
    Measure(Arc<Variable>),
    /// Write the value to the variable
    Set(Arc<Variable>, Value),
    /// Run the action with its argument
    Execute(Arc<Action>, Option<Value>),
    /// Sleep
    Wait(Duration),
}

/// A named step of a recipe.
#[derive(Debug, Clone)]
pub struct RecipeStep {
    name: String,
    action: StepAction,
}

impl RecipeStep {
    /// Builds a step, checking that `element` and `value` suit `kind`.
    ///
    /// - `measure`: readable variable, no value
    /// - `set`: writable variable and a value of its type
    /// - `execute`: action, with a value exactly when it has a parameter
    /// - `wait`: no element, a delay in seconds
    pub fn new(
        name: impl Into<String>,
        kind: StepKind,
        element: Option<Element>,
        value: Option<Value>,
    ) -> AppResult<Self> {
        let name = name.into();
        let action = match (kind, element) {
            (StepKind::Measure, Some(Element::Variable(variable))) => {
                if !variable.readable() {
                    return Err(LabError::usage(
                        variable.address(),
                        "measure step needs a readable variable",
                    ));
                }
                if value.is_some() {
                    return Err(LabError::usage(
                        variable.address(),
                        "measure step takes no value",
                    ));
                }
                StepAction::Measure(variable)
            }
            (StepKind::Set, Some(Element::Variable(variable))) => {
                if !variable.writable() {
                    return Err(LabError::usage(
                        variable.address(),
                        "set step needs a writable variable",
                    ));
                }
                let value = value.ok_or_else(|| {
                    LabError::usage(variable.address(), "set step needs a value")
                })?;
                let value = variable.coerce(value)?;
                StepAction::Set(variable, value)
            }
            (StepKind::Execute, Some(Element::Action(action))) => {
                let value = action.coerce(value)?;
                StepAction::Execute(action, value)
            }
            (StepKind::Wait, None) => {
                let seconds = value
                    .as_ref()
                    .and_then(|v| v.clone().coerce(ValueType::Float).ok())
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| {
                        LabError::Recipe(format!("wait step '{name}' needs a delay in seconds"))
                    })?;
                let delay = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    LabError::Recipe(format!(
                        "wait step '{name}' has an invalid delay of {seconds} s"
                    ))
                })?;
                StepAction::Wait(delay)
            }
            (StepKind::Wait, Some(element)) => {
                return Err(LabError::usage(
                    element.address(),
                    "wait step takes no element",
                ))
            }
            (kind, Some(element)) => {
                return Err(LabError::usage(
                    element.address(),
                    format!("a {kind} step cannot target a {}", element.kind()),
                ))
            }
            (kind, None) => {
                return Err(LabError::Recipe(format!(
                    "{kind} step '{name}' needs an element"
                )))
            }
        };
        Ok(Self { name, action })
    }

    /// Step reading `variable`.
    pub fn measure(name: impl Into<String>, variable: Arc<Variable>) -> AppResult<Self> {
        Self::new(name, StepKind::Measure, Some(Element::Variable(variable)), None)
    }

    /// Step writing `value` to `variable`.
    pub fn set(name: impl Into<String>, variable: Arc<Variable>, value: Value) -> AppResult<Self> {
        Self::new(name, StepKind::Set, Some(Element::Variable(variable)), Some(value))
    }

    /// Step running `action`, with `value` as argument if it takes one.
    pub fn execute(
        name: impl Into<String>,
        action: Arc<Action>,
        value: Option<Value>,
    ) -> AppResult<Self> {
        Self::new(name, StepKind::Execute, Some(Element::Action(action)), value)
    }

    /// Step sleeping for `seconds`.
    pub fn wait(name: impl Into<String>, seconds: f64) -> AppResult<Self> {
        Self::new(name, StepKind::Wait, None, Some(Value::Float(seconds)))
    }

    /// Step name, also its dataset column.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    /// What the step does.
    pub fn action(&self) -> &StepAction {
        &self.action
    }

    /// Kind of the step.
    pub fn kind(&self) -> StepKind {
        match self.action {
            StepAction::Measure(_) => StepKind::Measure,
            StepAction::Set(..) => StepKind::Set,
            StepAction::Execute(..) => StepKind::Execute,
            StepAction::Wait(_) => StepKind::Wait,
        }
    }

    /// Target element; `None` for waits.
    pub fn element(&self) -> Option<Element> {
        match &self.action {
            StepAction::Measure(v) | StepAction::Set(v, _) => Some(Element::Variable(v.clone())),
            StepAction::Execute(a, _) => Some(Element::Action(a.clone())),
            StepAction::Wait(_) => None,
        }
    }

    /// Address of the target element; `None` for waits.
    pub fn address(&self) -> Option<&str> {
        match &self.action {
            StepAction::Measure(v) | StepAction::Set(v, _) => Some(v.address()),
            StepAction::Execute(a, _) => Some(a.address()),
            StepAction::Wait(_) => None,
        }
    }

    /// Configured value: set value, action argument or delay in seconds.
    pub fn value(&self) -> Option<Value> {
        match &self.action {
            StepAction::Measure(_) => None,
            StepAction::Set(_, value) => Some(value.clone()),
            StepAction::Execute(_, value) => value.clone(),
            StepAction::Wait(delay) => Some(Value::Float(delay.as_secs_f64())),
        }
    }

    /// Rebuilds the step with a new value, validated like [`RecipeStep::new`].
    pub fn with_value(&self, value: Value) -> AppResult<Self> {
        Self::new(self.name.clone(), self.kind(), self.element(), Some(value))
    }

    /// Type of the value the step records, if it records one.
    pub fn recorded_type(&self) -> Option<ValueType> {
        match &self.action {
            StepAction::Measure(v) | StepAction::Set(v, _) => Some(v.value_type()),
            StepAction::Execute(a, _) => a.param_type(),
            StepAction::Wait(_) => None,
        }
    }

    /// Runs the step and returns the value to record.
    ///
    /// Waits sleep the calling thread; the scanner handles them itself so a
    /// stop request can cut the delay short.
    pub fn run(&self) -> AppResult<Option<Value>> {
        match &self.action {
            StepAction::Measure(variable) => variable.read().map(Some),
            StepAction::Set(variable, value) => variable.write(value.clone()).map(Some),
            StepAction::Execute(action, value) => action.call(value.clone()),
            StepAction::Wait(delay) => {
                std::thread::sleep(*delay);
                Ok(None)
            }
        }
    }
}

impl PartialEq for RecipeStep {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind() == other.kind()
            && self.address() == other.address()
            && self.value() == other.value()
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Values swept by a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValues {
    /// Linear or log range of a numerical variable
    Range(ScanRange),
    /// Explicit values, in order
    List(Vec<Value>),
}

/// A writable variable and the values it takes during the scan.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    variable: Arc<Variable>,
    values: ParameterValues,
}

impl Parameter {
    /// Parameter with the default range. The variable must be writable.
    pub fn new(name: impl Into<String>, variable: Arc<Variable>) -> AppResult<Self> {
        if !variable.writable() {
            return Err(LabError::usage(
                variable.address(),
                "parameter needs a writable variable",
            ));
        }
        let values = if variable.numerical() {
            ParameterValues::Range(ScanRange::default())
        } else {
            ParameterValues::List(vec![variable.value_type().default_value()])
        };
        Ok(Self {
            name: name.into(),
            variable,
            values,
        })
    }

    /// Same parameter sweeping `values`.
    pub fn with_values(mut self, values: ParameterValues) -> AppResult<Self> {
        self.set_values(values)?;
        Ok(self)
    }

    /// Parameter name, also its dataset column.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    /// Variable written at every point.
    pub fn variable(&self) -> &Arc<Variable> {
        &self.variable
    }

    /// Address of the variable.
    pub fn address(&self) -> &str {
        self.variable.address()
    }

    /// Values swept.
    pub fn values(&self) -> &ParameterValues {
        &self.values
    }

    /// The range, unless the values are an explicit list.
    pub fn range(&self) -> Option<&ScanRange> {
        match &self.values {
            ParameterValues::Range(range) => Some(range),
            ParameterValues::List(_) => None,
        }
    }

    /// Replaces the values after checking them against the variable.
    pub fn set_values(&mut self, values: ParameterValues) -> AppResult<()> {
        match &values {
            ParameterValues::Range(range) => {
                if !self.variable.numerical() {
                    return Err(LabError::usage(
                        self.variable.address(),
                        format!(
                            "a range needs a numerical variable, not {}",
                            self.variable.value_type()
                        ),
                    ));
                }
                range
                    .validate()
                    .map_err(|message| LabError::usage(self.variable.address(), message))?;
            }
            ParameterValues::List(list) => {
                if list.is_empty() {
                    return Err(LabError::usage(
                        self.variable.address(),
                        "parameter needs at least one value",
                    ));
                }
                for value in list {
                    self.variable.coerce(value.clone())?;
                }
            }
        }
        self.values = values;
        Ok(())
    }

    /// Values to write, coerced to the variable type.
    pub fn points(&self) -> AppResult<Vec<Value>> {
        match &self.values {
            ParameterValues::Range(range) => range
                .values()
                .map_err(|message| LabError::usage(self.variable.address(), message))?
                .into_iter()
                .map(|v| self.variable.coerce(Value::Float(v)))
                .collect(),
            ParameterValues::List(list) => list
                .iter()
                .map(|v| self.variable.coerce(v.clone()))
                .collect(),
        }
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.variable.address() == other.variable.address()
            && self.values == other.values
    }
}

// =============================================================================
// Scan configuration
// =============================================================================

/// Everything a scan runs: parameters and the three recipes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanConfig {
    /// Swept parameters, slowest first
    pub parameters: Vec<Parameter>,
    /// Run once before the first point
    pub init_recipe: Vec<RecipeStep>,
    /// Run at every point
    pub recipe: Vec<RecipeStep>,
    /// Run once after the last point
    pub end_recipe: Vec<RecipeStep>,
}

impl ScanConfig {
    /// Steps of the `kind` recipe.
    pub fn recipe(&self, kind: RecipeKind) -> &[RecipeStep] {
        match kind {
            RecipeKind::Init => &self.init_recipe,
            RecipeKind::Main => &self.recipe,
            RecipeKind::End => &self.end_recipe,
        }
    }

    pub(crate) fn recipe_mut(&mut self, kind: RecipeKind) -> &mut Vec<RecipeStep> {
        match kind {
            RecipeKind::Init => &mut self.init_recipe,
            RecipeKind::Main => &mut self.recipe,
            RecipeKind::End => &mut self.end_recipe,
        }
    }

    /// Every parameter and step name, in column order.
    pub fn names(&self) -> Vec<&str> {
        self.init_recipe
            .iter()
            .map(RecipeStep::name)
            .chain(self.parameters.iter().map(Parameter::name))
            .chain(self.recipe.iter().map(RecipeStep::name))
            .chain(self.end_recipe.iter().map(RecipeStep::name))
            .collect()
    }

    /// Whether a parameter or step is called `name`.
    pub fn contains_name(&self, name: &str) -> bool {
        self.names().contains(&name)
    }

    /// Cartesian product of the parameter values, last parameter fastest.
    ///
    /// Without parameters there is a single empty point.
    pub fn points(&self) -> AppResult<Vec<Vec<Value>>> {
        let axes = self
            .parameters
            .iter()
            .map(Parameter::points)
            .collect::<AppResult<Vec<_>>>()?;
        cartesian_product(&axes).map_err(LabError::Recipe)
    }
}

/// All combinations of one value per axis, the last axis varying fastest.
///
/// Fails when there would be more than [`MAX_POINTS`] combinations.
pub fn cartesian_product<T: Clone>(axes: &[Vec<T>]) -> Result<Vec<Vec<T>>, String> {
    if axes.iter().any(Vec::is_empty) {
        return Ok(Vec::new());
    }
    let total = axes
        .iter()
        .try_fold(1usize, |total, axis| total.checked_mul(axis.len()))
        .filter(|&total| total <= MAX_POINTS)
        .ok_or_else(|| format!("a scan holds at most {MAX_POINTS} points"))?;
    let mut points = Vec::with_capacity(total);
    let mut indices = vec![0usize; axes.len()];

    for _ in 0..total {
        points.push(
            indices
                .iter()
                .zip(axes)
                .map(|(&i, axis)| axis[i].clone())
                .collect(),
        );
        for axis in (0..axes.len()).rev() {
            indices[axis] += 1;
            if indices[axis] < axes[axis].len() {
                break;
            }
            indices[axis] = 0;
        }
    }
    Ok(points)
}
