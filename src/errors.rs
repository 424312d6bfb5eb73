//! Host-facing error type

use action_flow::FlowError;
use browserflow_core_types::CoreError;
use browserflow_policy_center::PolicyError;
use browserflow_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error("engine is not running")]
    NotStarted,
}

impl From<EngineError> for CoreError {
    fn from(value: EngineError) -> Self {
        CoreError::new(value.to_string())
    }
}
