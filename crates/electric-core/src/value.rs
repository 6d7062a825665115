//! Typed column values
//!
//! Both the snapshot query and the replication stream deliver column values
//! in PostgreSQL text format. [`Value::decode_text`] turns them into typed
//! values so that predicates can compare numbers as numbers; [`Value::to_wire`]
//! renders them back into the string form used in log items.

use std::collections::BTreeMap;
use std::fmt;

/// A row keyed by column name
pub type Row = BTreeMap<String, Value>;

/// Column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Decode a PostgreSQL text-format value of type `type_name`.
    ///
    /// Unparseable input for a typed column falls back to text so that no
    /// data is lost.
    pub fn decode_text(type_name: &str, text: &str) -> Value {
        match type_name {
            "bool" => match text {
                "t" | "true" => Value::Bool(true),
                "f" | "false" => Value::Bool(false),
                _ => Value::Text(text.to_string()),
            },
            "int2" | "int4" | "int8" | "oid" => text
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(text.to_string())),
            "float4" | "float8" => match text.parse::<f64>() {
                Ok(f) if f.is_finite() => Value::Float(f),
                _ => Value::Text(text.to_string()),
            },
            _ => Value::Text(text.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// String form used in log item `value` maps; `None` for NULL
    pub fn to_wire(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Numeric view used for coercing comparisons
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// Whether the value is a number (not a numeric-looking string)
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

/// Render a row as the wire `value` map, skipping NULLs
pub fn row_to_wire(row: &Row) -> BTreeMap<String, String> {
    row.iter()
        .filter_map(|(k, v)| v.to_wire().map(|s| (k.clone(), s)))
        .collect()
}
