//! Typed conversion of raw postgres change records.
//!
//! Change records arrive with every value in its text representation,
//! alongside the column definitions of the table. A [`RecordTransformer`]
//! turns such a record into typed JSON values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// A column definition attached to a change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Postgres type name (`int4`, `_text`, `timestamptz`, ...).
    #[serde(rename = "type")]
    pub type_name: String,
}

impl Column {
    /// Create a column definition.
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Converts a raw record into a typed one.
pub trait RecordTransformer: Send + Sync {
    /// Convert every field of `record` using the matching column type.
    fn convert(&self, columns: &[Column], record: &Map<String, Value>) -> Map<String, Value>;
}

/// Default transformer for postgres column types.
#[derive(Debug, Clone, Default)]
pub struct PostgresTransformer {
    skip_types: Vec<String>,
}

impl PostgresTransformer {
    /// Create a transformer converting every known type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave values of the given column types untouched.
    #[must_use]
    pub fn with_skip_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_types = types.into_iter().map(Into::into).collect();
        self
    }
}

impl RecordTransformer for PostgresTransformer {
    fn convert(&self, columns: &[Column], record: &Map<String, Value>) -> Map<String, Value> {
        record
            .iter()
            .map(|(key, value)| {
                let column_type = columns
                    .iter()
                    .find(|c| c.name == *key)
                    .map(|c| c.type_name.as_str());

                let converted = match column_type {
                    Some(ty) if !self.skip_types.iter().any(|s| s == ty) => {
                        convert_cell(ty, value.clone())
                    }
                    _ => value.clone(),
                };
                (key.clone(), converted)
            })
            .collect()
    }
}

/// Convert a single value of postgres type `ty`.
#[must_use]
pub fn convert_cell(ty: &str, value: Value) -> Value {
    if let Some(element_type) = ty.strip_prefix('_') {
        return to_array(element_type, value);
    }

    match ty {
        "bool" => to_boolean(value),
        "int2" | "int4" | "int8" | "float4" | "float8" | "numeric" | "oid" => to_number(value),
        "json" | "jsonb" => to_json(value),
        "timestamp" | "timestamptz" => to_timestamp(value),
        _ => value,
    }
}

fn to_boolean(value: Value) -> Value {
    match value.as_str() {
        Some("t" | "true") => Value::Bool(true),
        Some("f" | "false") => Value::Bool(false),
        _ => value,
    }
}

fn to_number(value: Value) -> Value {
    let Some(text) = value.as_str() else {
        return value;
    };
    let text = text.trim();

    if let Ok(int) = text.parse::<i64>() {
        return Value::Number(int.into());
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map_or(value, Value::Number)
}

fn to_json(value: Value) -> Value {
    match value.as_str() {
        Some(text) => serde_json::from_str(text).unwrap_or(value),
        None => value,
    }
}

fn to_timestamp(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.replace(' ', "T")),
        other => other,
    }
}

fn to_array(element_type: &str, value: Value) -> Value {
    let Some(inner) = value
        .as_str()
        .and_then(|s| s.strip_prefix('{'))
        .and_then(|s| s.strip_suffix('}'))
    else {
        return value;
    };

    let elements = match serde_json::from_str::<Vec<Value>>(&format!("[{inner}]")) {
        Ok(elements) => elements,
        Err(_) if inner.is_empty() => Vec::new(),
        Err(_) => inner
            .split(',')
            .map(|s| Value::String(s.to_string()))
            .collect(),
    };

    Value::Array(
        elements
            .into_iter()
            .map(|v| convert_cell(element_type, v))
            .collect(),
    )
}
