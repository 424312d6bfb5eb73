use browserflow_core_types::CoreError;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum LogError {
    #[error("logger is closed")]
    Closed,
    #[error("mirror write failed: {0}")]
    Mirror(String),
    #[error("timer '{0}' was not started")]
    TimerNotStarted(String),
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::Mirror(err.to_string())
    }
}

impl From<LogError> for CoreError {
    fn from(err: LogError) -> Self {
        CoreError::new(err.to_string())
    }
}
