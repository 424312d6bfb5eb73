use browserflow_core_types::{ErrorKind, FaultInfo};

// Checked in order; the first table with a matching needle wins.
const RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::ActuatorFatal,
        &[
            "browser closed",
            "target closed",
            "session deleted",
            "invalid session",
            "no such window",
            "disconnected",
            "crashed",
        ],
    ),
    (ErrorKind::Timeout, &["timed out", "timeout", "deadline exceeded"]),
    (
        ErrorKind::ElementNotFound,
        &[
            "element not found",
            "no such element",
            "unable to locate",
            "stale element",
            "selector matched nothing",
        ],
    ),
    (
        ErrorKind::Permission,
        &["permission", "access denied", "forbidden", "unauthorized", "not allowed"],
    ),
    (
        ErrorKind::Validation,
        &[
            "invalid argument",
            "invalid parameter",
            "missing parameter",
            "required parameter",
            "validation",
        ],
    ),
    (
        ErrorKind::System,
        &["out of memory", "no space left", "too many open files", "os error"],
    ),
    (
        ErrorKind::Network,
        &[
            "net::",
            "network",
            "connection",
            "dns",
            "socket",
            "unreachable",
            "proxy",
        ],
    ),
    (
        ErrorKind::Script,
        &[
            "javascript",
            "script",
            "syntaxerror",
            "referenceerror",
            "typeerror",
            "evaluation failed",
        ],
    ),
];

/// Classify a fault. Pre-classified faults keep their kind; everything else
/// is matched against message keywords.
pub fn classify(fault: &dyn FaultInfo) -> ErrorKind {
    if let Some(kind) = fault.kind_hint() {
        return kind;
    }
    classify_message(&fault.message())
}

pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_ascii_lowercase();
    RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}
