use browserflow_core_types::{CoreError, SessionTarget, TaskId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("task queue is full ({capacity} queued)")]
    QueueFull { capacity: usize },
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,
    #[error("unknown priority '{0}'")]
    InvalidPriority(String),
    #[error("invalid flow: {0}")]
    InvalidFlow(String),
}

impl From<SchedulerError> for CoreError {
    fn from(value: SchedulerError) -> Self {
        CoreError::new(value.to_string())
    }
}

/// Faults raised by an environment provider while managing sessions.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvironmentError {
    #[error("unknown target {0}")]
    UnknownTarget(SessionTarget),
    #[error("environment provider unavailable: {0}")]
    Unavailable(String),
    #[error("session {0} is not open")]
    UnknownSession(String),
}

impl From<EnvironmentError> for CoreError {
    fn from(value: EnvironmentError) -> Self {
        CoreError::new(format!("environment error: {value}"))
    }
}
