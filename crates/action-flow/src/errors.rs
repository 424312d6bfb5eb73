//! Flow execution error types

use action_primitives::ActuatorFault;
use browserflow_core_types::{CoreError, ErrorKind, FaultInfo};
use browserflow_execution_log::LogError;
use browserflow_variables::VariableError;
use thiserror::Error;

/// Flow execution errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    /// Block markers do not pair up, or a control step lacks its configuration
    #[error("Invalid flow structure: {0}")]
    InvalidStructure(String),

    /// Flow document could not be parsed or written
    #[error("Flow document error: {0}")]
    Document(String),

    /// Operation name has no handler
    #[error("unsupported operation '{0}'")]
    UnsupportedOperation(String),

    /// Required parameter absent
    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    /// Parameter present but unusable
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Condition could not be evaluated
    #[error("condition evaluation failed: {0}")]
    Condition(String),

    /// Step logic failed (bad arithmetic, unparseable data)
    #[error("step logic error: {0}")]
    Logic(String),

    /// Element lookup came back empty
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// Step exceeded its timeout
    #[error("step timed out after {0}ms")]
    Timeout(u64),

    /// Actuator call failed
    #[error(transparent)]
    Actuator(#[from] ActuatorFault),

    /// Variable store rejected a write
    #[error("variable error: {0}")]
    Variable(#[from] VariableError),

    /// Execution log refused an entry
    #[error("execution log error: {0}")]
    Log(#[from] LogError),
}

impl FlowError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        FlowError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl FaultInfo for FlowError {
    fn kind_hint(&self) -> Option<ErrorKind> {
        match self {
            FlowError::InvalidStructure(_)
            | FlowError::Document(_)
            | FlowError::UnsupportedOperation(_)
            | FlowError::MissingParameter(_)
            | FlowError::InvalidParameter { .. }
            | FlowError::Variable(_) => Some(ErrorKind::Validation),
            FlowError::Condition(_) | FlowError::Logic(_) => Some(ErrorKind::Script),
            FlowError::ElementNotFound(_) => Some(ErrorKind::ElementNotFound),
            FlowError::Timeout(_) => Some(ErrorKind::Timeout),
            FlowError::Log(_) => Some(ErrorKind::System),
            FlowError::Actuator(fault) => fault.kind,
        }
    }

    fn message(&self) -> String {
        match self {
            FlowError::Actuator(fault) => fault.message.clone(),
            other => other.to_string(),
        }
    }

    fn trace(&self) -> Option<&str> {
        match self {
            FlowError::Actuator(fault) => fault.trace.as_deref(),
            _ => None,
        }
    }
}

impl From<FlowError> for CoreError {
    fn from(err: FlowError) -> Self {
        CoreError::new(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Document(err.to_string())
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::Document(err.to_string())
    }
}
