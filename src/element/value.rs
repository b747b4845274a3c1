//! Values exchanged with drivers.
//!
//! A [`Variable`](super::Variable) or [`Action`](super::Action) declares one
//! [`ValueType`] from a closed set. Values written by callers are coerced to the
//! declared type before they reach the driver; arrays are always at least
//! one-dimensional.

use ndarray::{Array1, Array2, ArrayD};
use std::fmt;
use std::str::FromStr;

/// Closed set of types a driver can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `int`
    Int,
    /// `float`
    Float,
    /// `bool`
    Bool,
    /// `str`
    String,
    /// `bytes`
    Bytes,
    /// `array`, n-dimensional floats
    Array,
    /// `table`, labelled columns of floats
    Table,
}

impl ValueType {
    /// `int` and `float` are numerical; only they can be swept with a range.
    pub fn is_numerical(&self) -> bool {
        matches!(self, ValueType::Int | ValueType::Float)
    }

    /// Scalar values live in the dataset table, the others in side files.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            ValueType::Int | ValueType::Float | ValueType::Bool | ValueType::String
        )
    }

    /// Results of these types are expensive to recompute, the variable keeps the
    /// last one it read.
    pub fn is_cached(&self) -> bool {
        matches!(self, ValueType::Array | ValueType::Table)
    }

    /// Name used by drivers and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::String => "str",
            ValueType::Bytes => "bytes",
            ValueType::Array => "array",
            ValueType::Table => "table",
        }
    }

    /// Neutral value used when a recipe step is created without one.
    pub fn default_value(&self) -> Value {
        match self {
            ValueType::Int => Value::Int(0),
            ValueType::Float => Value::Float(0.0),
            ValueType::Bool => Value::Bool(false),
            ValueType::String => Value::String(String::new()),
            ValueType::Bytes => Value::Bytes(Vec::new()),
            ValueType::Array => Value::Array(Array1::<f64>::zeros(1).into_dyn()),
            ValueType::Table => Value::Table(Table::default()),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" => Ok(ValueType::Int),
            "float" => Ok(ValueType::Float),
            "bool" => Ok(ValueType::Bool),
            "str" | "string" => Ok(ValueType::String),
            "bytes" => Ok(ValueType::Bytes),
            "array" | "ndarray" => Ok(ValueType::Array),
            "table" | "dataframe" => Ok(ValueType::Table),
            other => Err(format!(
                "type '{other}' is not supported (expected int, float, bool, str, bytes, array or table)"
            )),
        }
    }
}

/// Column-labelled numeric table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Column labels
    pub columns: Vec<String>,
    /// One row per record, one column per label
    pub data: Array2<f64>,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            data: Array2::zeros((0, 0)),
        }
    }
}

/// A value read from or written to a driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Boolean
    Bool(bool),
    /// UTF-8 text
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Array of at least one dimension
    Array(ArrayD<f64>),
    /// Column-labelled table
    Table(Table),
}

impl Value {
    /// Type of the value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Array(_) => ValueType::Array,
            Value::Table(_) => ValueType::Table,
        }
    }

    /// Numeric view of scalar values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Builds a one-dimensional array value.
    pub fn array(values: Vec<f64>) -> Self {
        Value::Array(Array1::from(values).into_dyn())
    }

    /// Converts `self` to `target`.
    ///
    /// The error string describes the mismatch; callers attach the element
    /// address.
    pub fn coerce(self, target: ValueType) -> Result<Value, String> {
        let source = self.value_type();
        let mismatch = || format!("cannot convert {source} value to {target}");

        match target {
            ValueType::Int => match self {
                Value::Int(v) => Ok(Value::Int(v)),
                Value::Float(v) if v.is_finite() => Ok(Value::Int(v.trunc() as i64)),
                Value::Bool(v) => Ok(Value::Int(i64::from(v))),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|e| format!("cannot parse '{s}' as int: {e}")),
                _ => Err(mismatch()),
            },
            ValueType::Float => match self {
                Value::Int(v) => Ok(Value::Float(v as f64)),
                Value::Float(v) => Ok(Value::Float(v)),
                Value::Bool(v) => Ok(Value::Float(if v { 1.0 } else { 0.0 })),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|e| format!("cannot parse '{s}' as float: {e}")),
                _ => Err(mismatch()),
            },
            ValueType::Bool => match self {
                Value::Bool(v) => Ok(Value::Bool(v)),
                Value::Int(v) => Ok(Value::Bool(v != 0)),
                Value::Float(v) => Ok(Value::Bool(v != 0.0)),
                Value::String(s) => parse_bool(&s).map(Value::Bool),
                _ => Err(mismatch()),
            },
            ValueType::String => match self {
                Value::String(s) => Ok(Value::String(s)),
                Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
                    Ok(Value::String(self.to_string()))
                }
                Value::Bytes(b) => String::from_utf8(b)
                    .map(Value::String)
                    .map_err(|_| "bytes are not valid UTF-8".to_string()),
                _ => Err(mismatch()),
            },
            ValueType::Bytes => match self {
                Value::Bytes(b) => Ok(Value::Bytes(b)),
                Value::String(s) => Ok(Value::Bytes(s.into_bytes())),
                Value::Array(a) => a
                    .iter()
                    .map(|&v| byte_item(v))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Bytes),
                _ => Err(mismatch()),
            },
            ValueType::Array => match self {
                Value::Array(a) => Ok(Value::Array(at_least_1d(a))),
                Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
                    let v = self.as_f64().unwrap_or_default();
                    Ok(Value::array(vec![v]))
                }
                Value::String(s) => parse_array(&s).map(Value::array),
                _ => Err(mismatch()),
            },
            ValueType::Table => match self {
                Value::Table(t) => Ok(Value::Table(t)),
                _ => Err(mismatch()),
            },
        }
    }

    /// Parses the textual form used in config files.
    ///
    /// Bytes given as a bracketed list (`[0,255]`) are read item by item, any
    /// other text stands for its own UTF-8 encoding.
    pub fn parse(text: &str, target: ValueType) -> Result<Value, String> {
        match target {
            ValueType::Table => Err("table values cannot be given as text".to_string()),
            ValueType::Bytes if is_bracketed(text) => {
                Value::array(parse_array(text)?).coerce(ValueType::Bytes)
            }
            _ => Value::String(text.to_string()).coerce(target),
        }
    }

    /// Textual form used in config files; `None` for tables.
    ///
    /// Bytes are written as a bracketed list of their items so that any
    /// content survives the round trip through [`Value::parse`].
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Table(_) => None,
            Value::Bytes(b) => Some(format!(
                "[{}]",
                b.iter().map(u8::to_string).collect::<Vec<_>>().join(",")
            )),
            Value::Array(a) => Some(
                a.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(a) => write!(f, "<array {:?}>", a.shape()),
            Value::Table(t) => write!(f, "<table {}x{}>", t.data.nrows(), t.columns.len()),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

fn at_least_1d(array: ArrayD<f64>) -> ArrayD<f64> {
    if array.ndim() == 0 {
        Array1::from(array.iter().copied().collect::<Vec<_>>()).into_dyn()
    } else {
        array
    }
}

fn parse_bool(text: &str) -> Result<bool, String> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(format!("cannot parse '{other}' as bool")),
    }
}

fn is_bracketed(text: &str) -> bool {
    let text = text.trim();
    text.starts_with('[') && text.ends_with(']')
}

fn byte_item(value: f64) -> Result<u8, String> {
    if value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
        Ok(value as u8)
    } else {
        Err(format!("{value} is not a byte"))
    }
}

fn parse_array(text: &str) -> Result<Vec<f64>, String> {
    let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|item| {
            item.trim()
                .parse::<f64>()
                .map_err(|e| format!("cannot parse '{}' as array item: {e}", item.trim()))
        })
        .collect()
}
