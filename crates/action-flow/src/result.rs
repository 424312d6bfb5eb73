//! Per-step and per-run results

use std::collections::BTreeMap;

use browserflow_execution_log::LogSummary;
use exception_policy::ErrorRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// Guard condition was false; the step did not run
    ConditionFalse,
    FailedSkipped,
    FailedContinued,
    FailedStopped,
    /// Nothing to do, reported without failing (loop exit outside a loop)
    Handled,
}

impl StepStatus {
    /// Whether the run may carry on past this step.
    pub fn is_tolerated(self) -> bool {
        !matches!(self, StepStatus::FailedStopped)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StepStatus::FailedSkipped | StepStatus::FailedContinued | StepStatus::FailedStopped
        )
    }
}

/// Result of one step execution. Loop bodies produce one per iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub index: usize,
    pub operation: String,
    pub status: StepStatus,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl StepResult {
    pub(crate) fn new(step_id: &str, index: usize, operation: &str, status: StepStatus) -> Self {
        Self {
            step_id: step_id.to_string(),
            index,
            operation: operation.to_string(),
            status,
            success: !matches!(status, StepStatus::FailedStopped),
            message: String::new(),
            data: None,
            attempts: 0,
            duration_ms: 0,
            error: None,
        }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Outcome of one flow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub flow_name: String,
    /// Every executed step succeeded or had its failure tolerated
    pub success: bool,
    pub cancelled: bool,
    /// A `stop_flow` step ended the run early
    pub stopped_by_step: bool,
    pub step_results: Vec<StepResult>,
    pub completed_step_count: usize,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_index: Option<usize>,
    /// Every fault seen during the run, including tolerated ones
    pub errors: Vec<ErrorRecord>,
    /// Visible variables at the end of the run
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_summary: Option<LogSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn results_for(&self, step_id: &str) -> impl Iterator<Item = &StepResult> {
        let step_id = step_id.to_string();
        self.step_results
            .iter()
            .filter(move |result| result.step_id == step_id)
    }

    pub fn final_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }
}
