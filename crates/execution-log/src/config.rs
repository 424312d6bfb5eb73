use std::path::PathBuf;

use browserflow_policy_center::LoggingPolicy;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Entries kept in memory; older ones are evicted
    pub window_capacity: usize,
    /// Buffered entries that trigger a mirror write
    pub flush_threshold: usize,
    /// Entries kept per step
    pub step_window: usize,
    pub mirror: MirrorConfig,
}

/// Location of the on-disk copy of the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub root: PathBuf,
    pub compress: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            window_capacity: 2_000,
            flush_threshold: 50,
            step_window: 256,
            mirror: MirrorConfig::default(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: PathBuf::from("./task-logs"),
            compress: false,
        }
    }
}

impl From<&LoggingPolicy> for LoggerConfig {
    fn from(policy: &LoggingPolicy) -> Self {
        Self {
            window_capacity: policy.window_capacity,
            flush_threshold: policy.flush_threshold.max(1),
            step_window: policy.step_window,
            mirror: MirrorConfig {
                enabled: policy.mirror.enabled,
                root: policy.mirror.root.clone(),
                compress: policy.mirror.compress,
            },
        }
    }
}
