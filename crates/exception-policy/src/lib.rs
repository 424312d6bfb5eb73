//! Fault classification and recovery planning.
//!
//! A fault is classified into an [`ErrorKind`], the kind selects a
//! [`Strategy`], and the strategy plus the retry budget already spent on that
//! (step, kind) pair yields a [`RecoveryPlan`]. [`ExceptionPolicy::execute_with_recovery`]
//! drives the whole loop so callers never write their own retry logic.

pub mod classify;
pub mod policy;
pub mod record;
pub mod recovery;
pub mod strategy;

pub use browserflow_core_types::ErrorKind;
pub use classify::classify;
pub use policy::{ExceptionPolicy, PolicyStatistics};
pub use record::{ErrorRecord, RecoveryPlan};
pub use recovery::{AttemptContext, RecoveryOutcome, RecoveryReport};
pub use strategy::{OnError, RecoveryAction, Strategy, StrategyTable};
