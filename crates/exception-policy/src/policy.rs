use std::collections::{BTreeMap, HashMap, VecDeque};

use browserflow_core_types::{ErrorKind, FaultInfo, StepId};
use browserflow_policy_center::RecoveryPolicy;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::record::{ErrorRecord, RecoveryPlan};
use crate::strategy::{OnError, RecoveryAction, Strategy, StrategyTable};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatistics {
    pub total_errors: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub by_action: BTreeMap<String, u64>,
    /// (step, kind) pairs with retries currently outstanding
    pub active_counters: usize,
}

#[derive(Default)]
struct Counters {
    retries: HashMap<(StepId, ErrorKind), u32>,
    by_kind: BTreeMap<String, u64>,
    by_action: BTreeMap<String, u64>,
    total: u64,
}

/// Classifies faults and plans recovery for one task.
pub struct ExceptionPolicy {
    strategies: RwLock<StrategyTable>,
    counters: Mutex<Counters>,
    history: Mutex<VecDeque<ErrorRecord>>,
    history_capacity: usize,
}

impl Default for ExceptionPolicy {
    fn default() -> Self {
        Self::new(&browserflow_policy_center::default_snapshot().recovery)
    }
}

impl ExceptionPolicy {
    pub fn new(policy: &RecoveryPolicy) -> Self {
        Self {
            strategies: RwLock::new(StrategyTable::from_policy(policy)),
            counters: Mutex::new(Counters::default()),
            history: Mutex::new(VecDeque::new()),
            history_capacity: policy.error_history_capacity.max(1),
        }
    }

    pub fn classify(&self, fault: &dyn FaultInfo) -> ErrorKind {
        classify(fault)
    }

    pub fn strategy(&self, kind: ErrorKind) -> Strategy {
        self.strategies.read().get(kind)
    }

    /// Replace the strategy for one kind. Stop kinds still always stop.
    pub fn set_strategy(&self, kind: ErrorKind, strategy: Strategy) {
        if kind.always_stops() {
            warn!(%kind, "strategy override ignored for stop kind");
        }
        self.strategies.write().set(kind, strategy);
    }

    /// Plan recovery with the kind's default strategy.
    pub fn decide(&self, kind: ErrorKind, step_id: &StepId) -> RecoveryPlan {
        self.decide_with(kind, step_id, OnError::Auto, None)
    }

    /// Plan recovery honoring a step's preference and retry override.
    ///
    /// A plan that grants a retry consumes one unit of the (step, kind) budget.
    pub fn decide_with(
        &self,
        kind: ErrorKind,
        step_id: &StepId,
        preference: OnError,
        retry_override: Option<u32>,
    ) -> RecoveryPlan {
        if kind.always_stops() {
            let used = self
                .counters
                .lock()
                .retries
                .get(&(step_id.clone(), kind))
                .copied()
                .unwrap_or(0);
            return RecoveryPlan {
                kind,
                action: RecoveryAction::Stop,
                should_retry: false,
                retry_count: used,
                max_retries: 0,
                delay_ms: 0,
            };
        }

        let strategy = self
            .strategy(kind)
            .with_preference(preference, retry_override);
        let mut counters = self.counters.lock();
        let used = counters
            .retries
            .entry((step_id.clone(), kind))
            .or_insert(0);

        if strategy.action.retries() && *used < strategy.max_retries {
            *used += 1;
            RecoveryPlan {
                kind,
                action: strategy.action,
                should_retry: true,
                retry_count: *used,
                max_retries: strategy.max_retries,
                delay_ms: strategy.delay_ms,
            }
        } else {
            RecoveryPlan {
                kind,
                action: strategy.fallback,
                should_retry: false,
                retry_count: *used,
                max_retries: strategy.max_retries,
                delay_ms: 0,
            }
        }
    }

    /// Classify, plan and record one fault.
    pub fn handle(
        &self,
        fault: &dyn FaultInfo,
        step_id: &StepId,
        preference: OnError,
        retry_override: Option<u32>,
    ) -> ErrorRecord {
        let kind = classify(fault);
        let plan = self.decide_with(kind, step_id, preference, retry_override);
        let record = ErrorRecord {
            at: Utc::now(),
            kind,
            message: fault.message(),
            step_id: Some(step_id.clone()),
            plan,
            trace: fault.trace().map(str::to_string),
        };
        self.record(record.clone());
        record
    }

    /// Append a record to the bounded history.
    pub fn record(&self, record: ErrorRecord) {
        {
            let mut counters = self.counters.lock();
            counters.total += 1;
            *counters
                .by_kind
                .entry(record.kind.as_str().to_string())
                .or_insert(0) += 1;
            *counters
                .by_action
                .entry(record.plan.action.as_str().to_string())
                .or_insert(0) += 1;
        }
        match record.plan.action {
            RecoveryAction::Stop => warn!(
                kind = %record.kind,
                step_id = ?record.step_id,
                "fault stops the flow: {}",
                record.message
            ),
            action if record.plan.should_retry => info!(
                kind = %record.kind,
                step_id = ?record.step_id,
                %action,
                attempt = record.plan.retry_count,
                max = record.plan.max_retries,
                "recovering from fault: {}",
                record.message
            ),
            action => debug!(
                kind = %record.kind,
                step_id = ?record.step_id,
                %action,
                "fault handled: {}",
                record.message
            ),
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Clear every retry counter of `step_id`.
    pub fn record_success(&self, step_id: &StepId) {
        self.counters
            .lock()
            .retries
            .retain(|(step, _), _| step != step_id);
    }

    pub fn retries_used(&self, step_id: &StepId, kind: ErrorKind) -> u32 {
        self.counters
            .lock()
            .retries
            .get(&(step_id.clone(), kind))
            .copied()
            .unwrap_or(0)
    }

    pub fn history(&self) -> Vec<ErrorRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_for(&self, step_id: &StepId) -> Vec<ErrorRecord> {
        self.history
            .lock()
            .iter()
            .filter(|record| record.step_id.as_ref() == Some(step_id))
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> PolicyStatistics {
        let counters = self.counters.lock();
        let active = counters.retries.values().filter(|used| **used > 0).count();
        PolicyStatistics {
            total_errors: counters.total,
            by_kind: counters.by_kind.clone(),
            by_action: counters.by_action.clone(),
            active_counters: active,
        }
    }

    /// Forget counters and history.
    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
        self.history.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browserflow_core_types::CoreError;

    fn step(id: &str) -> StepId {
        StepId::from(id)
    }

    #[test]
    fn stop_kinds_never_retry() {
        let policy = ExceptionPolicy::default();
        for kind in [ErrorKind::Validation, ErrorKind::Permission, ErrorKind::System] {
            for preference in [OnError::Auto, OnError::Retry, OnError::Skip, OnError::Continue] {
                let plan = policy.decide_with(kind, &step("s1"), preference, Some(5));
                assert_eq!(plan.action, RecoveryAction::Stop);
                assert!(!plan.should_retry);
            }
        }
    }

    #[test]
    fn stop_kinds_ignore_overridden_strategy() {
        let policy = ExceptionPolicy::default();
        policy.set_strategy(
            ErrorKind::Validation,
            Strategy {
                action: RecoveryAction::Retry,
                max_retries: 9,
                delay_ms: 0,
                fallback: RecoveryAction::Skip,
            },
        );
        let plan = policy.decide(ErrorKind::Validation, &step("s1"));
        assert_eq!(plan.action, RecoveryAction::Stop);
    }

    #[test]
    fn budget_is_per_step_and_kind() {
        let policy = ExceptionPolicy::default();
        for expected in 1..=3 {
            let plan = policy.decide(ErrorKind::ElementNotFound, &step("a"));
            assert!(plan.should_retry);
            assert_eq!(plan.retry_count, expected);
        }
        let exhausted = policy.decide(ErrorKind::ElementNotFound, &step("a"));
        assert!(!exhausted.should_retry);
        assert_eq!(exhausted.action, RecoveryAction::Skip);

        // other step and other kind keep their own budget
        assert!(policy.decide(ErrorKind::ElementNotFound, &step("b")).should_retry);
        assert!(policy.decide(ErrorKind::Network, &step("a")).should_retry);
    }

    #[test]
    fn success_resets_counters() {
        let policy = ExceptionPolicy::default();
        policy.decide(ErrorKind::Timeout, &step("a"));
        policy.decide(ErrorKind::Timeout, &step("a"));
        assert_eq!(policy.retries_used(&step("a"), ErrorKind::Timeout), 2);
        policy.record_success(&step("a"));
        assert_eq!(policy.retries_used(&step("a"), ErrorKind::Timeout), 0);
        assert!(policy.decide(ErrorKind::Timeout, &step("a")).should_retry);
    }

    #[test]
    fn history_is_capped() {
        let mut recovery = browserflow_policy_center::default_snapshot().recovery;
        recovery.error_history_capacity = 2;
        let policy = ExceptionPolicy::new(&recovery);
        for message in ["one", "two", "three"] {
            policy.handle(&CoreError::new(message), &step("s"), OnError::Auto, None);
        }
        let history = policy.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "two");
        assert_eq!(policy.statistics().total_errors, 3);
    }

    #[test]
    fn handle_classifies_and_counts() {
        let policy = ExceptionPolicy::default();
        let record = policy.handle(
            &CoreError::new("script evaluation failed"),
            &step("s"),
            OnError::Auto,
            None,
        );
        assert_eq!(record.kind, ErrorKind::Script);
        assert_eq!(record.plan.action, RecoveryAction::Skip);
        let stats = policy.statistics();
        assert_eq!(stats.by_kind.get("script"), Some(&1));
        assert_eq!(stats.by_action.get("skip"), Some(&1));
    }
}
