use std::future::Future;

use browserflow_core_types::{FaultInfo, StepId};
use tokio::time::sleep;

use crate::policy::ExceptionPolicy;
use crate::record::ErrorRecord;
use crate::strategy::{OnError, RecoveryAction};

/// Passed to each invocation of the wrapped operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based
    pub attempt: u32,
    /// The previous attempt failed with a plan asking for a fresh actuator.
    pub restart_requested: bool,
}

#[derive(Debug)]
pub enum RecoveryOutcome<T> {
    Success(T),
    FailedStopped(ErrorRecord),
    FailedSkipped(ErrorRecord),
    FailedContinued(ErrorRecord),
}

impl<T> RecoveryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryOutcome::Success(_))
    }

    /// The flow may keep going after this outcome.
    pub fn is_tolerated(&self) -> bool {
        !matches!(self, RecoveryOutcome::FailedStopped(_))
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            RecoveryOutcome::Success(_) => None,
            RecoveryOutcome::FailedStopped(record)
            | RecoveryOutcome::FailedSkipped(record)
            | RecoveryOutcome::FailedContinued(record) => Some(record),
        }
    }
}

#[derive(Debug)]
pub struct RecoveryReport<T> {
    pub outcome: RecoveryOutcome<T>,
    pub attempts: u32,
    /// One record per failed attempt, in order
    pub errors: Vec<ErrorRecord>,
}

impl ExceptionPolicy {
    /// Run `operation` until it succeeds or the recovery plan gives up.
    ///
    /// Each fault is classified and planned against the (step, kind) budget;
    /// retry delays are slept here. The operation runs at most
    /// `max_retries + 1` times per error kind.
    pub async fn execute_with_recovery<T, E, F, Fut>(
        &self,
        step_id: &StepId,
        preference: OnError,
        retry_override: Option<u32>,
        mut operation: F,
    ) -> RecoveryReport<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FaultInfo,
    {
        let mut attempt = 0;
        let mut restart_requested = false;
        let mut errors = Vec::new();

        loop {
            attempt += 1;
            let context = AttemptContext {
                attempt,
                restart_requested,
            };
            let record = match operation(context).await {
                Ok(value) => {
                    self.record_success(step_id);
                    return RecoveryReport {
                        outcome: RecoveryOutcome::Success(value),
                        attempts: attempt,
                        errors,
                    };
                }
                Err(fault) => self.handle(&fault, step_id, preference, retry_override),
            };
            errors.push(record.clone());

            if record.plan.should_retry {
                restart_requested = record.plan.action == RecoveryAction::RestartActuator;
                let delay = record.plan.delay();
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                continue;
            }

            let outcome = match record.plan.action {
                RecoveryAction::Skip => RecoveryOutcome::FailedSkipped(record),
                RecoveryAction::Continue => RecoveryOutcome::FailedContinued(record),
                _ => RecoveryOutcome::FailedStopped(record),
            };
            return RecoveryReport {
                outcome,
                attempts: attempt,
                errors,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browserflow_core_types::{CoreError, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Fault(ErrorKind);

    impl FaultInfo for Fault {
        fn kind_hint(&self) -> Option<ErrorKind> {
            Some(self.0)
        }

        fn message(&self) -> String {
            "scripted fault".into()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_fault() {
        let policy = ExceptionPolicy::default();
        let step = StepId::from("click");
        let report = policy
            .execute_with_recovery(&step, OnError::Auto, None, |ctx| async move {
                if ctx.attempt < 2 {
                    Err(Fault(ErrorKind::ElementNotFound))
                } else {
                    Ok("clicked")
                }
            })
            .await;
        assert!(matches!(report.outcome, RecoveryOutcome::Success("clicked")));
        assert_eq!(report.attempts, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(policy.retries_used(&step, ErrorKind::ElementNotFound), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_by_retry_budget() {
        let policy = ExceptionPolicy::default();
        let calls = AtomicU32::new(0);
        let report = policy
            .execute_with_recovery(&StepId::from("nav"), OnError::Auto, None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Fault(ErrorKind::Network)) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.attempts, 4);
        assert!(matches!(report.outcome, RecoveryOutcome::FailedSkipped(_)));
    }

    #[tokio::test]
    async fn validation_stops_immediately() {
        let policy = ExceptionPolicy::default();
        let report = policy
            .execute_with_recovery(&StepId::from("s"), OnError::Retry, Some(5), |_| async {
                Err::<(), _>(Fault(ErrorKind::Validation))
            })
            .await;
        assert_eq!(report.attempts, 1);
        assert!(matches!(report.outcome, RecoveryOutcome::FailedStopped(_)));
        assert!(!report.outcome.is_tolerated());
    }

    #[tokio::test(start_paused = true)]
    async fn actuator_fatal_requests_restart() {
        let policy = ExceptionPolicy::default();
        let mut seen = Vec::new();
        let report = policy
            .execute_with_recovery(&StepId::from("s"), OnError::Auto, None, |ctx| {
                seen.push(ctx.restart_requested);
                async move {
                    if ctx.attempt == 1 {
                        Err(Fault(ErrorKind::ActuatorFatal))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(report.outcome.is_success());
        assert_eq!(seen, vec![false, true]);
    }

    #[test]
    fn continue_preference_tags_outcome() {
        tokio_test::block_on(async {
            let policy = ExceptionPolicy::default();
            let report = policy
                .execute_with_recovery(&StepId::from("s"), OnError::Continue, None, |_| async {
                    Err::<(), _>(CoreError::new("TypeError: x is undefined"))
                })
                .await;
            assert!(matches!(report.outcome, RecoveryOutcome::FailedContinued(_)));
            assert_eq!(report.attempts, 1);
        });
    }
}
