//! Flow documents: the persisted shape of a flow and its steps

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use action_primitives::SelectorKind;
use browserflow_core_types::StepId;
use exception_policy::OnError;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::blocks::BlockMap;
use crate::errors::FlowError;
use crate::operation::{Operation, OperationKind};

/// Flow definition - an ordered script of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Flow name
    #[serde(default)]
    pub name: String,

    /// Flow description
    #[serde(default)]
    pub description: String,

    /// Declared variables, seeded into the custom scope when a run starts
    #[serde(default, deserialize_with = "declared_variables")]
    pub variables: Map<String, Value>,

    /// Steps in execution order
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Flow metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    /// Fields this engine does not interpret, written back on export
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Flow {
    /// Create an empty flow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            variables: Map::new(),
            steps: Vec::new(),
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn from_json(text: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, FlowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), FlowError> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        Ok(())
    }

    /// Check step ids and block structure without running anything.
    pub fn validate(&self) -> Result<BlockMap, FlowError> {
        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(FlowError::InvalidStructure(format!(
                    "step {index} has an empty id"
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(FlowError::InvalidStructure(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }
        BlockMap::compile(&self.steps)
    }
}

/// Accepts either `{"name": value}` or `[{"name": .., "value": ..}]`.
fn declared_variables<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::Array(items) => {
            let mut map = Map::new();
            for item in items {
                let Value::Object(mut entry) = item else {
                    return Err(de::Error::custom("variable entries must be objects"));
                };
                let name = match entry.remove("name") {
                    Some(Value::String(name)) if !name.is_empty() => name,
                    _ => return Err(de::Error::custom("variable entry without a name")),
                };
                let value = entry
                    .remove("value")
                    .or_else(|| entry.remove("defaultValue"))
                    .unwrap_or(Value::Null);
                map.insert(name, value);
            }
            Ok(map)
        }
        other => Err(de::Error::custom(format!(
            "variables must be an object or array, got {other}"
        ))),
    }
}

/// One instruction in a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,

    pub operation: Operation,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// Milliseconds; the interpreter default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Replaces the strategy's retry budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(default, deserialize_with = "on_error_lenient")]
    pub on_error: OnError,

    /// Guard for ordinary steps; the predicate for `if` and `while`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Step {
    pub fn new(id: impl Into<String>, operation: impl Into<Operation>) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            name: String::new(),
            parameters: Map::new(),
            timeout: None,
            retry_count: None,
            on_error: OnError::Auto,
            condition: None,
            loop_config: None,
            extra: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_loop(mut self, config: LoopConfig) -> Self {
        self.loop_config = Some(config);
        self
    }

    pub fn step_id(&self) -> StepId {
        StepId::from(self.id.as_str())
    }

    pub fn kind(&self) -> Option<OperationKind> {
        self.operation.kind()
    }

    /// Name for logs: the display name when set, otherwise the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Predicate of an `if`/`while` step.
    ///
    /// Looks at `condition`, then `loopConfig.condition`, then a condition
    /// spelled out in the parameters.
    pub fn control_condition(&self) -> Option<Condition> {
        if let Some(condition) = &self.condition {
            return Some(condition.clone());
        }
        if let Some(condition) = self.loop_config.as_ref().and_then(|c| c.condition.clone()) {
            return Some(condition);
        }
        let variable = self.parameters.get("variable")?.as_str()?.to_string();
        let operator = self
            .parameters
            .get("operator")
            .and_then(Value::as_str)
            .map(ConditionOperator::from_str)
            .transpose()
            .ok()?
            .unwrap_or(ConditionOperator::Equals);
        Some(Condition {
            variable,
            operator,
            value: self.parameters.get("value").cloned().unwrap_or(Value::Null),
        })
    }
}

fn on_error_lenient<'de, D>(deserializer: D) -> Result<OnError, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(OnError::Auto),
        Some(raw) => raw.parse().map_err(de::Error::custom),
    }
}

/// Comparison between a variable's current value and a literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(variable: impl Into<String>, operator: ConditionOperator, value: impl Into<Value>) -> Self {
        Self {
            variable: variable.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConditionOperator {
    Exists,
    NotExists,
    #[default]
    Equals,
    NotEquals,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Contains,
    NotContains,
    In,
    NotIn,
}

impl ConditionOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionOperator::Exists => "exists",
            ConditionOperator::NotExists => "not_exists",
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::Greater => "greater",
            ConditionOperator::GreaterOrEqual => "greater_or_equal",
            ConditionOperator::Less => "less",
            ConditionOperator::LessOrEqual => "less_or_equal",
            ConditionOperator::Contains => "contains",
            ConditionOperator::NotContains => "not_contains",
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "not_in",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ConditionOperator::Greater
                | ConditionOperator::GreaterOrEqual
                | ConditionOperator::Less
                | ConditionOperator::LessOrEqual
        )
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionOperator {
    type Err = FlowError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let operator = match normalized.as_str() {
            "exists" | "is_set" => ConditionOperator::Exists,
            "not_exists" | "is_not_set" => ConditionOperator::NotExists,
            "equals" | "eq" | "==" | "=" => ConditionOperator::Equals,
            "not_equals" | "ne" | "!=" => ConditionOperator::NotEquals,
            "greater" | "greater_than" | "gt" | ">" => ConditionOperator::Greater,
            "greater_or_equal" | "greater_equal" | "gte" | ">=" => ConditionOperator::GreaterOrEqual,
            "less" | "less_than" | "lt" | "<" => ConditionOperator::Less,
            "less_or_equal" | "less_equal" | "lte" | "<=" => ConditionOperator::LessOrEqual,
            "contains" => ConditionOperator::Contains,
            "not_contains" => ConditionOperator::NotContains,
            "in" | "in_set" | "in_list" => ConditionOperator::In,
            "not_in" | "not_in_set" | "not_in_list" => ConditionOperator::NotIn,
            _ => return Err(FlowError::Condition(format!("unknown operator '{raw}'"))),
        };
        Ok(operator)
    }
}

impl Serialize for ConditionOperator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConditionOperator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Loop parameters for `loop_elements`, `loop_count`, `loop_data` and `while`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    #[serde(default)]
    pub selector_kind: SelectorKind,

    /// Number or a `${name}` reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Value>,

    /// Inline items for a data loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Variable holding the items when `data` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_variable: Option<String>,

    #[serde(default = "default_item_variable")]
    pub item_variable: String,

    #[serde(default = "default_index_variable")]
    pub index_variable: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

fn default_item_variable() -> String {
    "loop_item".to_string()
}

fn default_index_variable() -> String {
    "loop_index".to_string()
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            selector: None,
            selector_kind: SelectorKind::default(),
            count: None,
            data: None,
            source_variable: None,
            item_variable: default_item_variable(),
            index_variable: default_index_variable(),
            max_iterations: None,
            condition: None,
        }
    }
}

impl LoopConfig {
    pub fn elements(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Self::default()
        }
    }

    pub fn count(count: u64) -> Self {
        Self {
            count: Some(Value::from(count)),
            ..Self::default()
        }
    }

    pub fn data(items: Value) -> Self {
        Self {
            data: Some(items),
            ..Self::default()
        }
    }

    pub fn while_true(condition: Condition, max_iterations: u32) -> Self {
        Self {
            condition: Some(condition),
            max_iterations: Some(max_iterations),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOCUMENT: &str = r##"{
        "name": "login",
        "description": "log into the dashboard",
        "variables": [{"name": "user", "value": "alice"}],
        "exportedBy": "studio 2.3",
        "steps": [
            {"id": "s1", "operation": "navigate", "name": "open",
             "parameters": {"url": "https://example.test"}, "timeout": 5000},
            {"id": "s2", "operation": "click", "parameters": {"selector": "#go"},
             "retryCount": 2, "onError": "skip", "uiPosition": {"x": 10}},
            {"id": "s3", "operation": "hover_magic"}
        ]
    }"##;

    #[test]
    fn document_parses_with_passthrough() {
        let flow = Flow::from_json(DOCUMENT).unwrap();
        assert_eq!(flow.variables.get("user"), Some(&json!("alice")));
        assert_eq!(flow.extra.get("exportedBy"), Some(&json!("studio 2.3")));
        assert_eq!(flow.steps[0].timeout, Some(5000));
        assert_eq!(flow.steps[1].retry_count, Some(2));
        assert_eq!(flow.steps[1].on_error, OnError::Skip);
        assert_eq!(flow.steps[1].extra.get("uiPosition"), Some(&json!({"x": 10})));
        assert_eq!(flow.steps[2].operation, Operation::Unknown("hover_magic".into()));
    }

    #[test]
    fn export_keeps_opaque_fields() {
        let flow = Flow::from_json(DOCUMENT).unwrap();
        let exported: Value = serde_json::from_str(&flow.to_json().unwrap()).unwrap();
        assert_eq!(exported["exportedBy"], json!("studio 2.3"));
        assert_eq!(exported["steps"][1]["retryCount"], json!(2));
        assert_eq!(exported["steps"][1]["onError"], json!("skip"));
        assert_eq!(exported["steps"][1]["uiPosition"], json!({"x": 10}));
        assert_eq!(exported["steps"][2]["operation"], json!("hover_magic"));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let flow = Flow::new("dup")
            .with_step(Step::new("a", OperationKind::Refresh))
            .with_step(Step::new("a", OperationKind::Refresh));
        assert!(matches!(flow.validate(), Err(FlowError::InvalidStructure(_))));
    }

    #[test]
    fn operators_accept_symbols() {
        assert_eq!(">=".parse::<ConditionOperator>().unwrap(), ConditionOperator::GreaterOrEqual);
        assert_eq!("not-in".parse::<ConditionOperator>().unwrap(), ConditionOperator::NotIn);
        assert!("approximately".parse::<ConditionOperator>().is_err());
    }

    #[test]
    fn control_condition_falls_back_to_parameters() {
        let step = Step::new("c", OperationKind::If)
            .with_param("variable", "status")
            .with_param("operator", "!=")
            .with_param("value", "done");
        let condition = step.control_condition().unwrap();
        assert_eq!(condition.operator, ConditionOperator::NotEquals);
        assert_eq!(condition.value, json!("done"));
    }

    #[test]
    fn loop_config_defaults_variable_names() {
        let config: LoopConfig = serde_json::from_value(json!({"count": 3})).unwrap();
        assert_eq!(config.item_variable, "loop_item");
        assert_eq!(config.index_variable, "loop_index");
    }
}
