use std::time::Duration;

use browserflow_core_types::{ErrorKind, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::strategy::RecoveryAction;

/// Decision for one fault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub should_retry: bool,
    /// Retries consumed for this (step, kind), including the one this plan grants
    pub retry_count: u32,
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl RecoveryPlan {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    pub step_id: Option<StepId>,
    pub plan: RecoveryPlan,
    pub trace: Option<String>,
}
