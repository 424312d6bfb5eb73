use browserflow_core_types::CoreError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VariableError {
    #[error("variable name must not be empty")]
    EmptyName,
    #[error("no active loop scope for '{0}'")]
    NoLoopLayer(String),
    #[error("unknown scope '{0}'")]
    UnknownScope(String),
}

impl From<VariableError> for CoreError {
    fn from(err: VariableError) -> Self {
        CoreError::new(err.to_string())
    }
}
