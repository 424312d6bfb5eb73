use serde_json::{Map, Value};

use crate::condition::text_of;
use crate::errors::FlowError;

/// Typed reads over a step's resolved parameters.
///
/// Every getter takes a list of accepted names so older spellings
/// (`selector`/`css`, `text`/`value`) keep working.
#[derive(Clone, Copy)]
pub(crate) struct Params<'a> {
    raw: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    pub(crate) fn new(raw: &'a Map<String, Value>) -> Self {
        Self { raw }
    }

    pub(crate) fn value(&self, names: &[&str]) -> Option<&'a Value> {
        names
            .iter()
            .filter_map(|name| self.raw.get(*name))
            .find(|value| !value.is_null())
    }

    /// Text form of the first present parameter. Empty strings count as absent.
    pub(crate) fn text(&self, names: &[&str]) -> Option<String> {
        self.value(names)
            .map(text_of)
            .filter(|text| !text.is_empty())
    }

    pub(crate) fn require_text(&self, names: &[&str]) -> Result<String, FlowError> {
        self.text(names)
            .ok_or_else(|| FlowError::MissingParameter(names[0].to_string()))
    }

    /// Like `text` but keeps empty strings, for values where "" is meaningful.
    pub(crate) fn raw_text(&self, names: &[&str]) -> Option<String> {
        self.value(names).map(text_of)
    }

    pub(crate) fn number(&self, names: &[&str]) -> Result<Option<f64>, FlowError> {
        let Some(value) = self.value(names) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(num) => num.as_f64(),
            Value::String(text) if text.trim().is_empty() => return Ok(None),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            _ => None,
        };
        match parsed {
            Some(num) if num.is_finite() => Ok(Some(num)),
            Some(_) => Err(FlowError::invalid(
                names[0],
                format!("'{}' is not a finite number", text_of(value)),
            )),
            None => Err(FlowError::invalid(
                names[0],
                format!("'{}' is not a number", text_of(value)),
            )),
        }
    }

    pub(crate) fn require_number(&self, names: &[&str]) -> Result<f64, FlowError> {
        self.number(names)?
            .ok_or_else(|| FlowError::MissingParameter(names[0].to_string()))
    }

    pub(crate) fn unsigned(&self, names: &[&str]) -> Result<Option<u64>, FlowError> {
        match self.number(names)? {
            None => Ok(None),
            Some(num) if num >= 0.0 && num.fract() == 0.0 => Ok(Some(num as u64)),
            Some(num) => Err(FlowError::invalid(
                names[0],
                format!("{num} is not a non-negative integer"),
            )),
        }
    }

    pub(crate) fn integer(&self, names: &[&str]) -> Result<Option<i64>, FlowError> {
        match self.number(names)? {
            None => Ok(None),
            Some(num) if num.fract() == 0.0 => Ok(Some(num as i64)),
            Some(num) => Err(FlowError::invalid(names[0], format!("{num} is not an integer"))),
        }
    }

    pub(crate) fn flag(&self, names: &[&str], default: bool) -> bool {
        match self.value(names) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Number(num)) => num.as_f64().is_some_and(|num| num != 0.0),
            Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => true,
                "false" | "no" | "0" | "off" => false,
                _ => default,
            },
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn reads_first_present_alias() {
        let raw = map(json!({"css": "#a", "selector": null}));
        let params = Params::new(&raw);
        assert_eq!(params.text(&["selector", "css"]).as_deref(), Some("#a"));
        assert!(matches!(
            params.require_text(&["url"]),
            Err(FlowError::MissingParameter(name)) if name == "url"
        ));
    }

    #[test]
    fn numbers_accept_text() {
        let raw = map(json!({"count": "12", "ratio": "x", "neg": -2}));
        let params = Params::new(&raw);
        assert_eq!(params.unsigned(&["count"]).unwrap(), Some(12));
        assert!(params.number(&["ratio"]).is_err());
        assert!(params.unsigned(&["neg"]).is_err());
        assert_eq!(params.integer(&["neg"]).unwrap(), Some(-2));
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        let raw = map(json!({"a": "NaN", "b": "inf", "c": "-infinity", "d": "1e300"}));
        let params = Params::new(&raw);
        assert!(params.number(&["a"]).is_err());
        assert!(params.number(&["b"]).is_err());
        assert!(params.number(&["c"]).is_err());
        assert_eq!(params.number(&["d"]).unwrap(), Some(1e300));
    }

    #[test]
    fn flags_parse_words() {
        let raw = map(json!({"a": "yes", "b": 0}));
        let params = Params::new(&raw);
        assert!(params.flag(&["a"], false));
        assert!(!params.flag(&["b"], true));
        assert!(params.flag(&["missing"], true));
    }
}
