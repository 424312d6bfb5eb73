//! `${name}` and `${name.path}` substitution inside step parameters.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::store::VariableStore;
use crate::value::VarValue;

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}")
        .expect("reference pattern is valid")
});

impl VariableStore {
    /// Resolve one reference body (`name` or `name.path.0`).
    ///
    /// A stored name containing dots wins over path traversal.
    pub fn resolve_reference(&self, reference: &str) -> Option<VarValue> {
        if let Some(value) = self.get(reference) {
            return Some(value);
        }
        let (head, path) = reference.split_once('.')?;
        let root = self.get(head)?.to_json();
        let mut cursor = &root;
        for segment in path.split('.') {
            cursor = match cursor {
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                Value::Object(map) => map.get(segment)?,
                _ => return None,
            };
        }
        Some(VarValue::from_json(cursor.clone()))
    }

    /// Substitute every reference in `text`. Unknown names stay verbatim.
    pub fn resolve_text(&self, text: &str) -> String {
        if !text.contains("${") {
            return text.to_string();
        }
        REFERENCE
            .replace_all(text, |caps: &Captures| {
                match self.resolve_reference(&caps[1]) {
                    Some(value) => value.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Resolve references anywhere inside a JSON value.
    ///
    /// A string that is exactly one reference takes the referenced value's
    /// own type, so `"${count}"` yields a number.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => {
                if let Some(caps) = REFERENCE.captures(text) {
                    let whole = caps.get(0).is_some_and(|m| m.as_str().len() == text.len());
                    if whole {
                        if let Some(resolved) = self.resolve_reference(&caps[1]) {
                            return resolved.to_json();
                        }
                    }
                }
                Value::String(self.resolve_text(text))
            }
            Value::Array(items) => Value::Array(items.iter().map(|item| self.resolve_value(item)).collect()),
            Value::Object(map) => Value::Object(self.resolve_params(map)),
            other => other.clone(),
        }
    }

    pub fn resolve_params(&self, params: &Map<String, Value>) -> Map<String, Value> {
        params
            .iter()
            .map(|(key, value)| (key.clone(), self.resolve_value(value)))
            .collect()
    }
}
