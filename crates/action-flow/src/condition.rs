//! Evaluation of `if`/`while` predicates and step guards

use browserflow_variables::{VarValue, VariableStore};
use serde_json::Value;

use crate::errors::FlowError;
use crate::model::{Condition, ConditionOperator};

/// Evaluate `condition` against the current variables.
///
/// Numeric operators need both sides to parse as numbers; a parse failure is
/// an error rather than `false`.
pub fn evaluate(condition: &Condition, variables: &VariableStore) -> Result<bool, FlowError> {
    let name = strip_reference(&condition.variable);
    let actual = variables.resolve_reference(name);
    let present = actual.as_ref().is_some_and(|value| !value.is_empty());
    let actual = actual.unwrap_or_else(|| VarValue::Text(String::new()));
    let expected = variables.resolve_value(&condition.value);

    let outcome = match condition.operator {
        ConditionOperator::Exists => present,
        ConditionOperator::NotExists => !present,
        ConditionOperator::Equals => loosely_equal(&actual, &expected),
        ConditionOperator::NotEquals => !loosely_equal(&actual, &expected),
        ConditionOperator::Contains => actual.to_string().contains(&text_of(&expected)),
        ConditionOperator::NotContains => !actual.to_string().contains(&text_of(&expected)),
        ConditionOperator::In => members(&expected).iter().any(|item| loosely_equal(&actual, item)),
        ConditionOperator::NotIn => !members(&expected).iter().any(|item| loosely_equal(&actual, item)),
        numeric => {
            let left = actual.as_number().ok_or_else(|| {
                FlowError::Condition(format!(
                    "'{}' = '{}' is not a number",
                    condition.variable, actual
                ))
            })?;
            let right = number_of(&expected).ok_or_else(|| {
                FlowError::Condition(format!("'{}' is not a number", text_of(&expected)))
            })?;
            match numeric {
                ConditionOperator::Greater => left > right,
                ConditionOperator::GreaterOrEqual => left >= right,
                ConditionOperator::Less => left < right,
                _ => left <= right,
            }
        }
    };
    Ok(outcome)
}

/// `${name}` and `name` both refer to `name`.
fn strip_reference(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
        .unwrap_or(trimmed)
}

pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => VarValue::from_json(other.clone()).to_string(),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(num) => num.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(actual: &VarValue, expected: &Value) -> bool {
    if let (Some(left), Some(right)) = (actual.as_number(), number_of(expected)) {
        return (left - right).abs() < f64::EPSILON;
    }
    actual.to_string() == text_of(expected)
}

/// Set members from a JSON array, a JSON array in text form, or a
/// comma-separated list.
fn members(expected: &Value) -> Vec<Value> {
    match expected {
        Value::Array(items) => items.clone(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items,
            _ => text
                .split(',')
                .map(|item| Value::String(item.trim().to_string()))
                .collect(),
        },
        other => vec![other.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browserflow_variables::Scope;
    use serde_json::json;

    fn store() -> VariableStore {
        let store = VariableStore::default();
        store.set("count", 7_i64, Scope::Custom).unwrap();
        store.set("status", "ready", Scope::Custom).unwrap();
        store.set("label", "n/a", Scope::Custom).unwrap();
        store
    }

    fn check(variable: &str, operator: ConditionOperator, value: Value) -> Result<bool, FlowError> {
        evaluate(&Condition::new(variable, operator, value), &store())
    }

    #[test]
    fn existence_checks() {
        assert!(check("status", ConditionOperator::Exists, Value::Null).unwrap());
        assert!(check("ghost", ConditionOperator::NotExists, Value::Null).unwrap());
        assert!(check("${status}", ConditionOperator::Exists, Value::Null).unwrap());
    }

    #[test]
    fn numeric_comparisons_coerce_text() {
        assert!(check("count", ConditionOperator::Greater, json!("5")).unwrap());
        assert!(check("count", ConditionOperator::LessOrEqual, json!(7)).unwrap());
        assert!(check("count", ConditionOperator::Equals, json!("7.0")).unwrap());
    }

    #[test]
    fn numeric_parse_failure_is_an_error() {
        assert!(matches!(
            check("label", ConditionOperator::Greater, json!(1)),
            Err(FlowError::Condition(_))
        ));
        assert!(check("count", ConditionOperator::Less, json!("many")).is_err());
    }

    #[test]
    fn set_membership_forms() {
        assert!(check("status", ConditionOperator::In, json!(["idle", "ready"])).unwrap());
        assert!(check("status", ConditionOperator::In, json!("idle, ready")).unwrap());
        assert!(check("count", ConditionOperator::NotIn, json!("[1,2,3]")).unwrap());
    }

    #[test]
    fn contains_uses_text_form() {
        assert!(check("status", ConditionOperator::Contains, json!("ead")).unwrap());
        assert!(check("status", ConditionOperator::NotContains, json!("x")).unwrap());
    }
}
