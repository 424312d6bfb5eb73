use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use browserflow_policy_center::VariablePolicy;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::VariableError;
use crate::value::VarValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    System,
    Environment,
    Custom,
    Loop,
}

impl Scope {
    /// Lookup order, highest precedence first.
    pub const PRECEDENCE: [Scope; 4] = [Scope::Loop, Scope::Environment, Scope::Custom, Scope::System];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::System => "system",
            Scope::Environment => "environment",
            Scope::Custom => "custom",
            Scope::Loop => "loop",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = VariableError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Scope::System),
            "environment" | "env" => Ok(Scope::Environment),
            "custom" | "user" => Ok(Scope::Custom),
            "loop" => Ok(Scope::Loop),
            other => Err(VariableError::UnknownScope(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VariableLimits {
    pub max_value_len: usize,
    pub history_capacity: usize,
}

impl Default for VariableLimits {
    fn default() -> Self {
        Self {
            max_value_len: 10_000,
            history_capacity: 200,
        }
    }
}

impl From<&VariablePolicy> for VariableLimits {
    fn from(policy: &VariablePolicy) -> Self {
        Self {
            max_value_len: policy.max_value_len,
            history_capacity: policy.history_capacity,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableChange {
    pub name: String,
    pub scope: Scope,
    pub old: Option<VarValue>,
    pub new: Option<VarValue>,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Scopes {
    system: HashMap<String, VarValue>,
    environment: HashMap<String, VarValue>,
    custom: HashMap<String, VarValue>,
    /// innermost layer last
    loops: Vec<HashMap<String, VarValue>>,
}

impl Scopes {
    fn scope_mut(&mut self, scope: Scope) -> Option<&mut HashMap<String, VarValue>> {
        match scope {
            Scope::System => Some(&mut self.system),
            Scope::Environment => Some(&mut self.environment),
            Scope::Custom => Some(&mut self.custom),
            Scope::Loop => self.loops.last_mut(),
        }
    }

    fn get_in(&self, scope: Scope, name: &str) -> Option<&VarValue> {
        match scope {
            Scope::System => self.system.get(name),
            Scope::Environment => self.environment.get(name),
            Scope::Custom => self.custom.get(name),
            Scope::Loop => self.loops.iter().rev().find_map(|layer| layer.get(name)),
        }
    }
}

/// Per-task variable storage.
///
/// All operations are synchronous and guarded internally, so diagnostics may
/// read a store while its task is still writing to it.
pub struct VariableStore {
    scopes: RwLock<Scopes>,
    history: Mutex<VecDeque<VariableChange>>,
    limits: VariableLimits,
    execution_count: Mutex<u64>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new(VariableLimits::default())
    }
}

impl VariableStore {
    pub fn new(limits: VariableLimits) -> Self {
        let store = Self {
            scopes: RwLock::new(Scopes::default()),
            history: Mutex::new(VecDeque::new()),
            limits,
            execution_count: Mutex::new(0),
        };
        store.seed_system();
        store
    }

    pub fn from_policy(policy: &VariablePolicy) -> Self {
        Self::new(VariableLimits::from(policy))
    }

    pub fn limits(&self) -> VariableLimits {
        self.limits
    }

    /// Store `value` in `scope`. Oversized text is truncated, never rejected.
    pub fn set(
        &self,
        name: &str,
        value: impl Into<VarValue>,
        scope: Scope,
    ) -> Result<(), VariableError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VariableError::EmptyName);
        }
        let value: VarValue = value.into();
        let (value, truncated) = value.truncate(self.limits.max_value_len);
        if truncated {
            warn!(variable = name, limit = self.limits.max_value_len, "variable value truncated");
        }

        let old = {
            let mut scopes = self.scopes.write();
            let target = scopes
                .scope_mut(scope)
                .ok_or_else(|| VariableError::NoLoopLayer(name.to_string()))?;
            target.insert(name.to_string(), value.clone())
        };
        debug!(variable = name, %scope, "variable set");
        self.record(name, scope, old, Some(value));
        Ok(())
    }

    /// Store any serializable value; falls back to its `Debug` form when
    /// serialization fails.
    pub fn set_serialized<T>(&self, name: &str, value: &T, scope: Scope) -> Result<(), VariableError>
    where
        T: Serialize + fmt::Debug,
    {
        let coerced = match serde_json::to_value(value) {
            Ok(json) => VarValue::from_json(json),
            Err(err) => {
                debug!(variable = name, error = %err, "falling back to debug form");
                VarValue::Text(format!("{value:?}"))
            }
        };
        self.set(name, coerced, scope)
    }

    /// Highest-precedence value for `name`.
    pub fn get(&self, name: &str) -> Option<VarValue> {
        self.lookup(name).map(|(_, value)| value)
    }

    pub fn get_or(&self, name: &str, default: impl Into<VarValue>) -> VarValue {
        self.get(name).unwrap_or_else(|| default.into())
    }

    /// Value and the scope it was found in.
    pub fn lookup(&self, name: &str) -> Option<(Scope, VarValue)> {
        let scopes = self.scopes.read();
        Scope::PRECEDENCE
            .into_iter()
            .find_map(|scope| scopes.get_in(scope, name).map(|value| (scope, value.clone())))
    }

    pub fn get_in_scope(&self, name: &str, scope: Scope) -> Option<VarValue> {
        self.scopes.read().get_in(scope, name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn remove(&self, name: &str, scope: Scope) -> Option<VarValue> {
        let old = self
            .scopes
            .write()
            .scope_mut(scope)
            .and_then(|target| target.remove(name));
        if old.is_some() {
            self.record(name, scope, old.clone(), None);
        }
        old
    }

    /// Empty one scope. Clearing the loop scope empties every active layer
    /// but keeps the layers themselves.
    pub fn clear(&self, scope: Scope) {
        let mut scopes = self.scopes.write();
        match scope {
            Scope::Loop => scopes.loops.iter_mut().for_each(HashMap::clear),
            other => {
                if let Some(target) = scopes.scope_mut(other) {
                    target.clear();
                }
            }
        }
        debug!(%scope, "variable scope cleared");
    }

    /// Empty every scope and re-seed the system built-ins.
    pub fn clear_all(&self) {
        {
            let mut scopes = self.scopes.write();
            *scopes = Scopes::default();
        }
        *self.execution_count.lock() = 0;
        self.history.lock().clear();
        self.seed_system();
        debug!("all variable scopes cleared");
    }

    /// Flattened, precedence-resolved view of every visible name.
    pub fn snapshot(&self) -> BTreeMap<String, VarValue> {
        let scopes = self.scopes.read();
        let mut resolved = BTreeMap::new();
        // lowest precedence first so higher scopes overwrite
        for map in [&scopes.system, &scopes.custom, &scopes.environment] {
            for (name, value) in map {
                resolved.insert(name.clone(), value.clone());
            }
        }
        for layer in &scopes.loops {
            for (name, value) in layer {
                resolved.insert(name.clone(), value.clone());
            }
        }
        resolved
    }

    /// Names and values of one scope; loop layers are merged innermost-wins.
    pub fn scope_entries(&self, scope: Scope) -> BTreeMap<String, VarValue> {
        let scopes = self.scopes.read();
        match scope {
            Scope::Loop => scopes
                .loops
                .iter()
                .flat_map(|layer| layer.iter())
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            Scope::System => clone_map(&scopes.system),
            Scope::Environment => clone_map(&scopes.environment),
            Scope::Custom => clone_map(&scopes.custom),
        }
    }

    pub fn push_loop_layer(&self) -> usize {
        let mut scopes = self.scopes.write();
        scopes.loops.push(HashMap::new());
        scopes.loops.len()
    }

    /// Drop the innermost loop layer and everything bound in it.
    /// Returns `false` when no layer was active.
    pub fn pop_loop_layer(&self) -> bool {
        self.scopes.write().loops.pop().is_some()
    }

    pub fn loop_depth(&self) -> usize {
        self.scopes.read().loops.len()
    }

    pub fn history(&self) -> Vec<VariableChange> {
        self.history.lock().iter().cloned().collect()
    }

    /// Mark the start of a run: bumps `execution_count` and refreshes the
    /// time built-ins.
    pub fn begin_execution(&self) -> u64 {
        let count = {
            let mut count = self.execution_count.lock();
            *count += 1;
            *count
        };
        self.refresh_time();
        let mut scopes = self.scopes.write();
        scopes
            .system
            .insert("execution_count".into(), VarValue::from(count as f64));
        count
    }

    fn seed_system(&self) {
        self.refresh_time();
        let seed = rand::thread_rng().gen_range(0..1_000_000u32);
        let count = *self.execution_count.lock();
        let mut scopes = self.scopes.write();
        scopes
            .system
            .insert("random_seed".into(), VarValue::from(seed as f64));
        scopes
            .system
            .insert("execution_count".into(), VarValue::from(count as f64));
    }

    fn refresh_time(&self) {
        let now = chrono::Local::now();
        let mut scopes = self.scopes.write();
        scopes.system.insert(
            "current_time".into(),
            VarValue::Text(now.format("%H:%M:%S").to_string()),
        );
        scopes.system.insert(
            "current_date".into(),
            VarValue::Text(now.format("%Y-%m-%d").to_string()),
        );
        scopes
            .system
            .insert("timestamp".into(), VarValue::from(now.timestamp() as f64));
    }

    fn record(&self, name: &str, scope: Scope, old: Option<VarValue>, new: Option<VarValue>) {
        if self.limits.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.limits.history_capacity {
            history.pop_front();
        }
        history.push_back(VariableChange {
            name: name.to_string(),
            scope,
            old,
            new,
            at: Utc::now(),
        });
    }
}

fn clone_map(map: &HashMap<String, VarValue>) -> BTreeMap<String, VarValue> {
    map.iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TRUNCATION_MARKER;

    #[test]
    fn precedence_is_loop_environment_custom_system() {
        let store = VariableStore::default();
        store.set("name", "system", Scope::System).unwrap();
        assert_eq!(store.get("name"), Some(VarValue::from("system")));

        store.set("name", "custom", Scope::Custom).unwrap();
        assert_eq!(store.get("name"), Some(VarValue::from("custom")));

        store.set("name", "environment", Scope::Environment).unwrap();
        assert_eq!(store.get("name"), Some(VarValue::from("environment")));

        store.push_loop_layer();
        store.set("name", "loop", Scope::Loop).unwrap();
        assert_eq!(store.lookup("name"), Some((Scope::Loop, VarValue::from("loop"))));

        assert!(store.pop_loop_layer());
        assert_eq!(store.get("name"), Some(VarValue::from("environment")));
        assert_eq!(
            store.get_in_scope("name", Scope::Custom),
            Some(VarValue::from("custom"))
        );
    }

    #[test]
    fn loop_write_without_layer_is_rejected() {
        let store = VariableStore::default();
        let err = store.set("item", 1i64, Scope::Loop).unwrap_err();
        assert_eq!(err, VariableError::NoLoopLayer("item".into()));
        assert!(!store.pop_loop_layer());
    }

    #[test]
    fn nested_loop_layers_shadow_outward() {
        let store = VariableStore::default();
        store.push_loop_layer();
        store.set("loop_index", 0i64, Scope::Loop).unwrap();
        store.set("outer_only", true, Scope::Loop).unwrap();
        store.push_loop_layer();
        store.set("loop_index", 7i64, Scope::Loop).unwrap();

        assert_eq!(store.get("loop_index"), Some(VarValue::Number(7.0)));
        assert_eq!(store.get("outer_only"), Some(VarValue::Bool(true)));

        store.pop_loop_layer();
        assert_eq!(store.get("loop_index"), Some(VarValue::Number(0.0)));
        store.pop_loop_layer();
        assert_eq!(store.get("loop_index"), None);
    }

    #[test]
    fn oversized_values_are_truncated() {
        let store = VariableStore::new(VariableLimits {
            max_value_len: 4,
            history_capacity: 10,
        });
        store.set("big", "abcdefgh", Scope::Custom).unwrap();
        assert_eq!(
            store.get("big"),
            Some(VarValue::Text(format!("abcd{TRUNCATION_MARKER}")))
        );
    }

    #[test]
    fn clear_all_reseeds_system_builtins() {
        let store = VariableStore::default();
        store.set("x", 1i64, Scope::Custom).unwrap();
        store.begin_execution();
        store.clear_all();
        assert!(store.get("x").is_none());
        for name in ["current_time", "current_date", "timestamp", "random_seed", "execution_count"] {
            assert!(store.get_in_scope(name, Scope::System).is_some(), "{name} missing");
        }
        assert_eq!(store.get("execution_count"), Some(VarValue::Number(0.0)));
    }

    #[test]
    fn clear_single_scope_leaves_others() {
        let store = VariableStore::default();
        store.set("a", "env", Scope::Environment).unwrap();
        store.set("b", "custom", Scope::Custom).unwrap();
        store.clear(Scope::Custom);
        assert!(store.get("b").is_none());
        assert_eq!(store.get("a"), Some(VarValue::from("env")));
    }

    #[test]
    fn begin_execution_counts_runs() {
        let store = VariableStore::default();
        assert_eq!(store.begin_execution(), 1);
        assert_eq!(store.begin_execution(), 2);
        assert_eq!(store.get("execution_count"), Some(VarValue::Number(2.0)));
    }

    #[test]
    fn snapshot_resolves_precedence() {
        let store = VariableStore::default();
        store.set("k", "custom", Scope::Custom).unwrap();
        store.set("k", "env", Scope::Environment).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.get("k"), Some(&VarValue::from("env")));
        assert!(snapshot.contains_key("random_seed"));
    }

    #[test]
    fn history_is_bounded() {
        let store = VariableStore::new(VariableLimits {
            max_value_len: 100,
            history_capacity: 3,
        });
        for i in 0..5i64 {
            store.set("n", i, Scope::Custom).unwrap();
        }
        let history = store.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].new, Some(VarValue::Number(4.0)));
        assert_eq!(history[2].old, Some(VarValue::Number(3.0)));
    }

    #[test]
    fn serialization_failure_falls_back_to_debug() {
        #[derive(Debug)]
        struct Opaque;
        impl Serialize for Opaque {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("nope"))
            }
        }
        let store = VariableStore::default();
        store.set_serialized("o", &Opaque, Scope::Custom).unwrap();
        assert_eq!(store.get("o"), Some(VarValue::from("Opaque")));

        store
            .set_serialized("list", &vec![1, 2], Scope::Custom)
            .unwrap();
        assert_eq!(store.get("list"), Some(VarValue::Composite("[1,2]".into())));
    }
}
