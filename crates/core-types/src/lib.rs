use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// Shared error type for the engine crates.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("{message}")]
    Message { message: String },
}

impl CoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StepId(pub String);

impl StepId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the browser profile a task runs against.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionTarget(pub String);

impl SessionTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification bucket used to pick a recovery strategy.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-full", serde(rename_all = "snake_case"))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Network,
    ElementNotFound,
    Timeout,
    ActuatorFatal,
    Script,
    Validation,
    Permission,
    System,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Network,
        ErrorKind::ElementNotFound,
        ErrorKind::Timeout,
        ErrorKind::ActuatorFatal,
        ErrorKind::Script,
        ErrorKind::Validation,
        ErrorKind::Permission,
        ErrorKind::System,
        ErrorKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ActuatorFatal => "actuator_fatal",
            ErrorKind::Script => "script",
            ErrorKind::Validation => "validation",
            ErrorKind::Permission => "permission",
            ErrorKind::System => "system",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Kinds that no amount of retrying can fix.
    pub fn always_stops(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::Permission | ErrorKind::System
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .or(match normalized.as_str() {
                "logic" | "script_logic" => Some(ErrorKind::Script),
                "actuator" | "browser" => Some(ErrorKind::ActuatorFatal),
                _ => None,
            })
            .ok_or_else(|| CoreError::new(format!("unknown error kind '{raw}'")))
    }
}

/// Anything that can be handed to the recovery engine as a fault.
///
/// `kind_hint` is `Some` for faults that were already classified at the
/// source; raw faults leave it `None` and get classified from the message.
pub trait FaultInfo {
    fn kind_hint(&self) -> Option<ErrorKind>;
    fn message(&self) -> String;
    fn trace(&self) -> Option<&str> {
        None
    }
}

impl FaultInfo for CoreError {
    fn kind_hint(&self) -> Option<ErrorKind> {
        None
    }

    fn message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_parses_aliases() {
        assert_eq!(
            "element-not-found".parse::<ErrorKind>().unwrap(),
            ErrorKind::ElementNotFound
        );
        assert_eq!("logic".parse::<ErrorKind>().unwrap(), ErrorKind::Script);
        assert!("bogus".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn stop_kinds_are_fixed() {
        let stopping: Vec<_> = ErrorKind::ALL
            .into_iter()
            .filter(|kind| kind.always_stops())
            .collect();
        assert_eq!(
            stopping,
            vec![ErrorKind::Validation, ErrorKind::Permission, ErrorKind::System]
        );
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }
}
