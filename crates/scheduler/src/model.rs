use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use action_flow::ExecutionResult;
use browserflow_core_types::{SessionTarget, TaskId};
use browserflow_policy_center::SchedulerPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Declared urgency of a task; higher values are dispatched first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Low,
        TaskPriority::Normal,
        TaskPriority::High,
        TaskPriority::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = SchedulerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        TaskPriority::ALL
            .into_iter()
            .find(|priority| priority.as_str() == normalized)
            .or(match normalized.as_str() {
                "urgent" => Some(TaskPriority::Critical),
                "medium" | "default" => Some(TaskPriority::Normal),
                _ => None,
            })
            .ok_or_else(|| SchedulerError::InvalidPriority(raw.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a task, safe to hand out while the task runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub target: SessionTarget,
    pub flow_name: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 0..=100
    pub progress: u8,
    pub current_step_index: Option<usize>,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub running: usize,
    pub queued: usize,
    pub workers: usize,
    pub paused: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub shutdown_timeout: Duration,
    pub retention: RetentionConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetentionConfig {
    pub max_finished: usize,
    pub max_age: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 256,
            shutdown_timeout: Duration::from_secs(30),
            retention: RetentionConfig {
                max_finished: 1_000,
                max_age: Duration::from_secs(3_600),
            },
        }
    }
}

impl From<&SchedulerPolicy> for SchedulerConfig {
    fn from(policy: &SchedulerPolicy) -> Self {
        Self {
            worker_count: policy.worker_count.max(1),
            queue_capacity: policy.queue_capacity.max(1),
            shutdown_timeout: Duration::from_millis(policy.shutdown_timeout_ms),
            retention: RetentionConfig {
                max_finished: policy.retention.max_finished,
                max_age: Duration::from_secs(policy.retention.max_age_secs),
            },
        }
    }
}
