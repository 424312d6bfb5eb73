use std::path::PathBuf;

use crate::model::{
    InterpreterPolicy, LoggingPolicy, MirrorPolicy, PolicySnapshot, RecoveryPolicy,
    RetentionPolicy, SchedulerPolicy, VariablePolicy,
};

pub fn default_snapshot() -> PolicySnapshot {
    PolicySnapshot {
        rev: 1,
        scheduler: SchedulerPolicy {
            worker_count: 4,
            queue_capacity: 256,
            shutdown_timeout_ms: 30_000,
            retention: RetentionPolicy {
                max_finished: 1_000,
                max_age_secs: 3_600,
            },
        },
        interpreter: InterpreterPolicy {
            default_step_timeout_ms: 30_000,
            max_while_iterations: 1_000,
            max_element_loop: 500,
        },
        recovery: RecoveryPolicy {
            retry_delay_ms: 1_000,
            network_delay_ms: 2_000,
            timeout_delay_ms: 3_000,
            error_history_capacity: 100,
        },
        variables: VariablePolicy {
            max_value_len: 10_000,
            history_capacity: 200,
        },
        logging: LoggingPolicy {
            window_capacity: 2_000,
            flush_threshold: 50,
            step_window: 256,
            mirror: MirrorPolicy {
                enabled: false,
                root: PathBuf::from("./task-logs"),
                compress: false,
            },
        },
        provenance: Default::default(),
    }
}
