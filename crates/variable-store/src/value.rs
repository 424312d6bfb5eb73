use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Appended to values cut down to the configured length.
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// A stored variable value.
///
/// Arrays and objects are kept as their JSON text so every value has a
/// stable string form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VarValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Composite(String),
}

impl VarValue {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => VarValue::Text(String::new()),
            Value::Bool(flag) => VarValue::Bool(flag),
            Value::Number(num) => match num.as_f64() {
                Some(num) => VarValue::Number(num),
                None => VarValue::Text(num.to_string()),
            },
            Value::String(text) => VarValue::Text(text),
            composite @ (Value::Array(_) | Value::Object(_)) => {
                VarValue::Composite(composite.to_string())
            }
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            VarValue::Text(text) => Value::String(text.clone()),
            VarValue::Number(num) => number_to_json(*num),
            VarValue::Bool(flag) => Value::Bool(*flag),
            VarValue::Composite(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
        }
    }

    /// Numeric view. Text that parses as a number counts.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            VarValue::Number(num) => Some(*num),
            VarValue::Text(text) => text.trim().parse::<f64>().ok(),
            VarValue::Bool(_) | VarValue::Composite(_) => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            VarValue::Bool(flag) => *flag,
            VarValue::Number(num) => *num != 0.0,
            VarValue::Text(text) => {
                !matches!(text.trim().to_ascii_lowercase().as_str(), "" | "false" | "0" | "no")
            }
            VarValue::Composite(raw) => !matches!(raw.as_str(), "[]" | "{}"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            VarValue::Text(text) | VarValue::Composite(text) => text.is_empty(),
            VarValue::Number(_) | VarValue::Bool(_) => false,
        }
    }

    pub(crate) fn truncate(self, max_len: usize) -> (Self, bool) {
        match self {
            VarValue::Text(text) => {
                let (text, cut) = truncate_text(text, max_len);
                (VarValue::Text(text), cut)
            }
            VarValue::Composite(raw) => {
                let (raw, cut) = truncate_text(raw, max_len);
                // a cut composite is no longer valid JSON
                if cut {
                    (VarValue::Text(raw), true)
                } else {
                    (VarValue::Composite(raw), false)
                }
            }
            other => (other, false),
        }
    }
}

fn truncate_text(text: String, max_len: usize) -> (String, bool) {
    if max_len == 0 || text.chars().count() <= max_len {
        return (text, false);
    }
    let mut cut: String = text.chars().take(max_len).collect();
    cut.push_str(TRUNCATION_MARKER);
    (cut, true)
}

fn number_to_json(num: f64) -> Value {
    if num.fract() == 0.0 && num.abs() < i64::MAX as f64 {
        Value::from(num as i64)
    } else {
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Text(text) | VarValue::Composite(text) => f.write_str(text),
            VarValue::Number(num) if num.fract() == 0.0 && num.abs() < 1e15 => {
                write!(f, "{}", *num as i64)
            }
            VarValue::Number(num) => write!(f, "{num}"),
            VarValue::Bool(flag) => write!(f, "{flag}"),
        }
    }
}

impl From<Value> for VarValue {
    fn from(value: Value) -> Self {
        VarValue::from_json(value)
    }
}

impl From<&str> for VarValue {
    fn from(value: &str) -> Self {
        VarValue::Text(value.to_string())
    }
}

impl From<String> for VarValue {
    fn from(value: String) -> Self {
        VarValue::Text(value)
    }
}

impl From<f64> for VarValue {
    fn from(value: f64) -> Self {
        VarValue::Number(value)
    }
}

impl From<i64> for VarValue {
    fn from(value: i64) -> Self {
        VarValue::Number(value as f64)
    }
}

impl From<usize> for VarValue {
    fn from(value: usize) -> Self {
        VarValue::Number(value as f64)
    }
}

impl From<bool> for VarValue {
    fn from(value: bool) -> Self {
        VarValue::Bool(value)
    }
}
