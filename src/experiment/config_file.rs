//! ini-style scan configuration files.
//!
//! ```text
//! [autolab]
//! version = 0.1.0
//! timestamp = 2024-05-01T10:00:00+02:00
//!
//! [parameter]
//! name = amplitude
//! address = laser.amplitude
//! nbpts = 11
//! start_value = 0
//! end_value = 10
//! log = 0
//!
//! [recipe]
//! 1_name = power
//! 1_stepType = measure
//! 1_address = laser.power
//! ```
//!
//! Further parameters go to `[parameter_2]`, `[parameter_3]`, ...; explicit
//! value lists replace the range keys with `values = ["a", "b"]`. The
//! `[init_recipe]` and `[end_recipe]` sections use the `[recipe]` keys.
//! Keys are matched case-insensitively. String values are stored as JSON
//! string literals so that surrounding spaces and line breaks survive; a bare
//! string in a hand-written file is read as-is. Bytes are stored as a list of
//! their items (`[104,105]`). Every address is resolved against the live
//! devices; any failure rejects the whole file.

use super::range::ScanRange;
use super::recipe::{Parameter, ParameterValues, RecipeKind, RecipeStep, ScanConfig, StepKind};
use crate::device::ElementResolver;
use crate::element::{Element, Value, ValueType};
use crate::error::{AppResult, LabError};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const HEADER_SECTION: &str = "autolab";
const PARAMETER_SECTION: &str = "parameter";

// =============================================================================
// ini document
// =============================================================================

#[derive(Debug, Default)]
struct IniDocument {
    sections: IndexMap<String, IndexMap<String, String>>,
}

impl IniDocument {
    fn parse(text: &str) -> Result<Self, String> {
        let mut doc = IniDocument::default();
        let mut current: Option<String> = None;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let section = section.trim().to_string();
                doc.sections.entry(section.clone()).or_default();
                current = Some(section);
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected 'key = value'", number + 1))?;
            let section = current
                .as_ref()
                .ok_or_else(|| format!("line {}: key outside of a section", number + 1))?;
            doc.sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_lowercase(), value.trim().to_string());
        }
        Ok(doc)
    }

    fn section(&self, name: &str) -> Option<&IndexMap<String, String>> {
        self.sections.get(name)
    }
}

struct IniWriter {
    out: String,
}

impl IniWriter {
    fn new() -> Self {
        Self { out: String::new() }
    }

    fn section(&mut self, name: &str) {
        if !self.out.is_empty() {
            self.out.push('\n');
        }
        let _ = writeln!(self.out, "[{name}]");
    }

    fn entry(&mut self, key: &str, value: impl std::fmt::Display) {
        let _ = writeln!(self.out, "{key} = {value}");
    }
}

// =============================================================================
// Export
// =============================================================================

/// Renders `config` as an ini document.
pub fn to_config_string(config: &ScanConfig) -> AppResult<String> {
    let mut ini = IniWriter::new();
    ini.section(HEADER_SECTION);
    ini.entry("version", env!("CARGO_PKG_VERSION"));
    ini.entry("timestamp", chrono::Local::now().to_rfc3339());

    for (index, parameter) in config.parameters.iter().enumerate() {
        ini.section(&parameter_section(index));
        ini.entry("name", parameter.name());
        ini.entry("address", parameter.address());
        match parameter.values() {
            ParameterValues::Range(range) => {
                ini.entry("nbpts", range.nbpts);
                ini.entry("start_value", range.start);
                ini.entry("end_value", range.end);
                ini.entry("log", u8::from(range.log));
            }
            ParameterValues::List(values) => {
                let texts = values
                    .iter()
                    .map(|v| value_text(v, parameter.address()))
                    .collect::<AppResult<Vec<_>>>()?;
                ini.entry("values", serde_json::to_string(&texts)?);
            }
        }
    }

    for kind in [RecipeKind::Init, RecipeKind::Main, RecipeKind::End] {
        let steps = config.recipe(kind);
        if steps.is_empty() && kind != RecipeKind::Main {
            continue;
        }
        ini.section(kind.section());
        for (i, step) in steps.iter().enumerate() {
            let i = i + 1;
            ini.entry(&format!("{i}_name"), step.name());
            ini.entry(&format!("{i}_stepType"), step.kind().file_name());
            if let Some(address) = step.address() {
                ini.entry(&format!("{i}_address"), address);
            }
            if let Some(value) = step.value() {
                let text = value_text(&value, step.address().unwrap_or(step.name()))?;
                ini.entry(&format!("{i}_value"), text);
            }
        }
    }

    Ok(ini.out)
}

/// Writes `config` to `path`.
pub fn export(config: &ScanConfig, path: impl AsRef<Path>) -> AppResult<()> {
    let text = to_config_string(config)?;
    fs::write(path.as_ref(), text)?;
    Ok(())
}

fn parameter_section(index: usize) -> String {
    if index == 0 {
        PARAMETER_SECTION.to_string()
    } else {
        format!("{PARAMETER_SECTION}_{}", index + 1)
    }
}

fn value_text(value: &Value, address: &str) -> AppResult<String> {
    if let Value::String(text) = value {
        return Ok(serde_json::to_string(text)?);
    }
    value.to_text().ok_or_else(|| {
        LabError::usage(
            address,
            format!("{} values cannot be stored in a config file", value.value_type()),
        )
    })
}

/// Inverse of [`value_text`].
fn parse_value(text: &str, value_type: ValueType) -> Result<Value, String> {
    if value_type == ValueType::String && text.starts_with('"') {
        return serde_json::from_str::<String>(text)
            .map(Value::String)
            .map_err(|e| format!("invalid quoted string {text}: {e}"));
    }
    Value::parse(text, value_type)
}

// =============================================================================
// Import
// =============================================================================

/// Reads and resolves the configuration stored at `path`.
pub fn import(path: impl AsRef<Path>, resolver: &dyn ElementResolver) -> AppResult<ScanConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| LabError::ConfigFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    from_config_str(&text, resolver, &path.display().to_string())
}

/// Parses `text`; `origin` names the source in error messages.
pub fn from_config_str(
    text: &str,
    resolver: &dyn ElementResolver,
    origin: &str,
) -> AppResult<ScanConfig> {
    let file_error = |message: String| LabError::ConfigFile {
        path: origin.to_string(),
        message,
    };
    let doc = IniDocument::parse(text).map_err(file_error)?;

    let mut config = ScanConfig::default();
    for index in 0.. {
        let section_name = parameter_section(index);
        let Some(section) = doc.section(&section_name) else {
            break;
        };
        if section.is_empty() {
            break;
        }
        config
            .parameters
            .push(read_parameter(&section_name, section, resolver, &file_error)?);
    }

    for kind in [RecipeKind::Init, RecipeKind::Main, RecipeKind::End] {
        if let Some(section) = doc.section(kind.section()) {
            *config.recipe_mut(kind) = read_recipe(kind.section(), section, resolver, &file_error)?;
        }
    }

    let mut seen = HashSet::new();
    for name in config.names() {
        if !seen.insert(name) {
            return Err(file_error(format!("name '{name}' is used twice")));
        }
    }
    Ok(config)
}

fn read_parameter(
    section_name: &str,
    section: &IndexMap<String, String>,
    resolver: &dyn ElementResolver,
    file_error: &dyn Fn(String) -> LabError,
) -> AppResult<Parameter> {
    let address = section
        .get("address")
        .ok_or_else(|| file_error(format!("[{section_name}] has no address")))?;
    let variable = match resolver.resolve_address(address)? {
        Element::Variable(variable) => variable,
        other => {
            return Err(LabError::usage(
                address,
                format!("parameter must be a variable, not a {}", other.kind()),
            ))
        }
    };
    let name = section
        .get("name")
        .cloned()
        .unwrap_or_else(|| variable.name().to_string());
    let parameter = Parameter::new(name, variable.clone())?;

    let values = if let Some(list) = section.get("values") {
        let texts: Vec<String> = serde_json::from_str(list)
            .map_err(|e| file_error(format!("[{section_name}] values: {e}")))?;
        let values = texts
            .iter()
            .map(|text| {
                parse_value(text, variable.value_type())
                    .map_err(|message| LabError::usage(address, message))
            })
            .collect::<AppResult<Vec<_>>>()?;
        ParameterValues::List(values)
    } else {
        let defaults = ScanRange::default();
        let number = |key: &str, default: f64| -> AppResult<f64> {
            match section.get(key) {
                None => Ok(default),
                Some(text) => text
                    .parse::<f64>()
                    .map_err(|e| file_error(format!("[{section_name}] {key}: {e}"))),
            }
        };
        let nbpts = match section.get("nbpts") {
            None => defaults.nbpts,
            Some(text) => text
                .parse::<usize>()
                .map_err(|e| file_error(format!("[{section_name}] nbpts: {e}")))?,
        };
        let log = match section.get("log").map(|s| s.to_lowercase()) {
            None => defaults.log,
            Some(text) => match text.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                other => return Err(file_error(format!("[{section_name}] log: '{other}'"))),
            },
        };
        ParameterValues::Range(ScanRange {
            start: number("start_value", defaults.start)?,
            end: number("end_value", defaults.end)?,
            nbpts,
            log,
        })
    };

    parameter.with_values(values)
}

fn read_recipe(
    section_name: &str,
    section: &IndexMap<String, String>,
    resolver: &dyn ElementResolver,
    file_error: &dyn Fn(String) -> LabError,
) -> AppResult<Vec<RecipeStep>> {
    let mut indices: Vec<u32> = section
        .keys()
        .filter_map(|key| key.split_once('_'))
        .filter_map(|(index, _)| index.parse().ok())
        .collect();
    indices.sort_unstable();
    indices.dedup();

    let mut steps = Vec::with_capacity(indices.len());
    for i in indices {
        let get = |field: &str| section.get(&format!("{i}_{field}"));
        let name = get("name")
            .ok_or_else(|| file_error(format!("[{section_name}] step {i} has no name")))?;
        let kind = get("steptype")
            .ok_or_else(|| file_error(format!("[{section_name}] step {i} has no stepType")))?
            .parse::<StepKind>()
            .map_err(|message| file_error(format!("[{section_name}] step {i}: {message}")))?;

        let element = match get("address") {
            Some(address) if kind != StepKind::Wait => Some(resolver.resolve_address(address)?),
            _ => None,
        };
        let value_type = match (&element, kind) {
            (_, StepKind::Wait) => Some(ValueType::Float),
            (Some(Element::Variable(v)), StepKind::Set) => Some(v.value_type()),
            (Some(Element::Action(a)), StepKind::Execute) => a.param_type(),
            _ => None,
        };
        let value = match (get("value"), value_type) {
            (Some(text), Some(ty)) => Some(parse_value(text, ty).map_err(|message| {
                LabError::usage(
                    element.as_ref().map(Element::address).unwrap_or(name.as_str()),
                    message,
                )
            })?),
            _ => None,
        };

        steps.push(RecipeStep::new(name.clone(), kind, element, value)?);
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ini_parse() {
        let doc = IniDocument::parse(
            "; comment\n[autolab]\nversion = 1.0\n\n[recipe]\n1_stepType=measure\n1_name = a=b\n",
        )
        .unwrap();
        let recipe = doc.section("recipe").unwrap();
        assert_eq!(recipe.get("1_steptype").map(String::as_str), Some("measure"));
        assert_eq!(recipe.get("1_name").map(String::as_str), Some("a=b"));
        assert_eq!(
            doc.section("autolab").and_then(|s| s.get("version")).map(String::as_str),
            Some("1.0")
        );
    }

    #[test]
    fn test_ini_parse_errors() {
        assert!(IniDocument::parse("key = value\n").is_err());
        assert!(IniDocument::parse("[s]\nno equals sign\n").is_err());
    }

    #[test]
    fn test_ini_writer() {
        let mut ini = IniWriter::new();
        ini.section("a");
        ini.entry("x", 1.5);
        ini.section("b");
        assert_eq!(ini.out, "[a]\nx = 1.5\n\n[b]\n");
    }

    #[test]
    fn test_string_values_are_quoted() {
        for text in ["  padded  ", "line1\nline2", "\"quoted\" = yes", ""] {
            let value = Value::from(text);
            let stored = value_text(&value, "dev.label").unwrap();
            assert!(!stored.contains('\n'));
            let doc = IniDocument::parse(&format!("[recipe]\n1_value = {stored}\n")).unwrap();
            let read = doc.section("recipe").and_then(|s| s.get("1_value")).unwrap();
            assert_eq!(parse_value(read, ValueType::String), Ok(value));
        }
        assert_eq!(
            parse_value("plain text", ValueType::String),
            Ok(Value::from("plain text"))
        );
        assert!(parse_value("\"unterminated", ValueType::String).is_err());
    }

    #[test]
    fn test_parameter_sections() {
        assert_eq!(parameter_section(0), "parameter");
        assert_eq!(parameter_section(1), "parameter_2");
    }
}
