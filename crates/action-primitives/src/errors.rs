//! Fault type raised by actuators

use browserflow_core_types::{ErrorKind, FaultInfo};
use thiserror::Error;

/// A failed actuator call.
///
/// Bindings that know what went wrong set `kind`; everything else is
/// classified later from the message.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message}")]
pub struct ActuatorFault {
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub trace: Option<String>,
}

impl ActuatorFault {
    /// Unclassified fault
    pub fn raw(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
            trace: None,
        }
    }

    /// Fault already classified by the binding
    pub fn classified(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
            trace: None,
        }
    }

    pub fn element_not_found(selector: &str) -> Self {
        Self::classified(
            ErrorKind::ElementNotFound,
            format!("element not found: {selector}"),
        )
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::classified(ErrorKind::Timeout, what)
    }

    pub fn unsupported(what: &str) -> Self {
        Self::classified(
            ErrorKind::Script,
            format!("operation not supported by this actuator: {what}"),
        )
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl FaultInfo for ActuatorFault {
    fn kind_hint(&self) -> Option<ErrorKind> {
        self.kind
    }

    fn message(&self) -> String {
        self.message.clone()
    }

    fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}
