use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Effective configuration, with the source of every leaf that was set.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct PolicySnapshot {
    pub rev: u64,
    pub scheduler: SchedulerPolicy,
    pub interpreter: InterpreterPolicy,
    pub recovery: RecoveryPolicy,
    pub variables: VariablePolicy,
    pub logging: LoggingPolicy,
    #[serde(default)]
    pub provenance: BTreeMap<String, PolicyProvenance>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct SchedulerPolicy {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub shutdown_timeout_ms: u64,
    pub retention: RetentionPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct RetentionPolicy {
    pub max_finished: usize,
    pub max_age_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct InterpreterPolicy {
    pub default_step_timeout_ms: u64,
    pub max_while_iterations: u32,
    pub max_element_loop: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct RecoveryPolicy {
    pub retry_delay_ms: u64,
    pub network_delay_ms: u64,
    pub timeout_delay_ms: u64,
    pub error_history_capacity: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct VariablePolicy {
    pub max_value_len: usize,
    pub history_capacity: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct LoggingPolicy {
    pub window_capacity: usize,
    pub flush_threshold: usize,
    pub step_window: usize,
    pub mirror: MirrorPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct MirrorPolicy {
    pub enabled: bool,
    pub root: PathBuf,
    pub compress: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyProvenance {
    pub path: String,
    pub source: PolicySource,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Builtin,
    File,
    Env,
    Cli,
    RuntimeOverride,
}

/// Provenance-free view handed to the runtime crates.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyView {
    pub rev: u64,
    pub scheduler: SchedulerPolicy,
    pub interpreter: InterpreterPolicy,
    pub recovery: RecoveryPolicy,
    pub variables: VariablePolicy,
    pub logging: LoggingPolicy,
}

impl From<PolicySnapshot> for PolicyView {
    fn from(snapshot: PolicySnapshot) -> Self {
        Self {
            rev: snapshot.rev,
            scheduler: snapshot.scheduler,
            interpreter: snapshot.interpreter,
            recovery: snapshot.recovery,
            variables: snapshot.variables,
            logging: snapshot.logging,
        }
    }
}

impl Default for PolicyView {
    fn default() -> Self {
        PolicyView::from(crate::defaults::default_snapshot())
    }
}

impl PolicySnapshot {
    pub fn set_provenance(&mut self, path: &str, source: PolicySource) {
        self.provenance.insert(
            path.to_string(),
            PolicyProvenance {
                path: path.to_string(),
                source,
            },
        );
    }

    pub fn source_of(&self, path: &str) -> Option<PolicySource> {
        self.provenance.get(path).map(|entry| entry.source)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeOverrideSpec {
    pub path: String,
    pub value: serde_json::Value,
    pub owner: String,
    pub reason: String,
    pub ttl_seconds: u64,
}
