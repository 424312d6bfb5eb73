//! Task scheduling for browserflow
//!
//! Tasks (one flow bound to one session target) wait in a bounded priority
//! queue and are dispatched to a fixed-size pool of tokio workers. Each worker
//! acquires a session from the [`EnvironmentProvider`], runs the flow through
//! its own `FlowInterpreter`, releases the session and records the outcome.

pub mod environment;
pub mod error;
pub mod executor;
pub mod model;
pub mod queue;
pub mod runtime;
pub mod scheduler;

pub use environment::{EnvironmentProvider, SessionHandle, SessionInfo, StaticEnvironmentProvider};
pub use error::{EnvironmentError, SchedulerError};
pub use executor::{ActuatorFactory, FnActuatorFactory, SharedActuator};
pub use model::{
    RetentionConfig, SchedulerConfig, SchedulerStatistics, TaskPriority, TaskSnapshot, TaskStatus,
};
pub use runtime::CompletionCallback;
pub use scheduler::{ShutdownReport, TaskScheduler};
