use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use browserflow_core_types::{CoreError, ErrorKind};
use browserflow_policy_center::RecoveryPolicy;
use serde::{Deserialize, Serialize};

/// What to do about a fault
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    WaitAndRetry,
    Skip,
    Stop,
    Continue,
    RestartActuator,
}

impl RecoveryAction {
    /// Actions that re-run the step.
    pub fn retries(self) -> bool {
        matches!(
            self,
            RecoveryAction::Retry | RecoveryAction::WaitAndRetry | RecoveryAction::RestartActuator
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::WaitAndRetry => "wait_and_retry",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Stop => "stop",
            RecoveryAction::Continue => "continue",
            RecoveryAction::RestartActuator => "restart_actuator",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step's declared on-error preference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Auto,
    Retry,
    Skip,
    Continue,
    Stop,
}

impl FromStr for OnError {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" | "default" => Ok(OnError::Auto),
            "retry" => Ok(OnError::Retry),
            "skip" => Ok(OnError::Skip),
            "continue" | "ignore" => Ok(OnError::Continue),
            "stop" | "abort" => Ok(OnError::Stop),
            other => Err(CoreError::new(format!("unknown on-error preference '{other}'"))),
        }
    }
}

/// Recovery strategy for one error kind.
///
/// `action` applies while retries remain; `fallback` applies once they run out
/// (or immediately for non-retrying actions).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub action: RecoveryAction,
    pub max_retries: u32,
    pub delay_ms: u64,
    pub fallback: RecoveryAction,
}

impl Strategy {
    pub const fn terminal(action: RecoveryAction) -> Self {
        Self {
            action,
            max_retries: 0,
            delay_ms: 0,
            fallback: action,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Fold a step's preference and retry override into this strategy.
    pub fn with_preference(mut self, preference: OnError, retry_override: Option<u32>) -> Self {
        match preference {
            OnError::Auto => {}
            OnError::Retry => {
                if !self.action.retries() {
                    self.action = RecoveryAction::Retry;
                    self.max_retries = self.max_retries.max(FORCED_RETRIES);
                }
            }
            OnError::Skip => self.fallback = RecoveryAction::Skip,
            OnError::Continue => self.fallback = RecoveryAction::Continue,
            OnError::Stop => self.fallback = RecoveryAction::Stop,
        }
        if let Some(retries) = retry_override {
            self.max_retries = retries;
        }
        if !self.action.retries() {
            self.action = self.fallback;
        }
        self
    }
}

/// Budget used when a step asks for retries on a kind that normally has none.
const FORCED_RETRIES: u32 = 3;

/// Per-kind strategies
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyTable {
    strategies: HashMap<ErrorKind, Strategy>,
}

impl StrategyTable {
    pub fn from_policy(policy: &RecoveryPolicy) -> Self {
        use RecoveryAction::*;

        let retry = |action, max_retries, delay_ms, fallback| Strategy {
            action,
            max_retries,
            delay_ms,
            fallback,
        };
        let strategies = HashMap::from([
            (ErrorKind::Network, retry(WaitAndRetry, 3, policy.network_delay_ms, Skip)),
            (ErrorKind::ElementNotFound, retry(Retry, 3, policy.retry_delay_ms, Skip)),
            (ErrorKind::Timeout, retry(WaitAndRetry, 2, policy.timeout_delay_ms, Skip)),
            (ErrorKind::ActuatorFatal, retry(RestartActuator, 1, policy.retry_delay_ms, Stop)),
            (ErrorKind::Script, Strategy::terminal(Skip)),
            (ErrorKind::Validation, Strategy::terminal(Stop)),
            (ErrorKind::Permission, Strategy::terminal(Stop)),
            (ErrorKind::System, Strategy::terminal(Stop)),
            (ErrorKind::Unknown, retry(Retry, 1, policy.retry_delay_ms, Stop)),
        ]);
        Self { strategies }
    }

    pub fn get(&self, kind: ErrorKind) -> Strategy {
        self.strategies
            .get(&kind)
            .copied()
            .unwrap_or(Strategy::terminal(RecoveryAction::Stop))
    }

    pub fn set(&mut self, kind: ErrorKind, strategy: Strategy) {
        self.strategies.insert(kind, strategy);
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::from_policy(&browserflow_policy_center::default_snapshot().recovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_kind_table() {
        let table = StrategyTable::default();
        let network = table.get(ErrorKind::Network);
        assert_eq!(network.action, RecoveryAction::WaitAndRetry);
        assert_eq!(network.max_retries, 3);
        assert_eq!(network.fallback, RecoveryAction::Skip);
        assert_eq!(table.get(ErrorKind::Script).action, RecoveryAction::Skip);
        assert_eq!(
            table.get(ErrorKind::ActuatorFatal).action,
            RecoveryAction::RestartActuator
        );
    }

    #[test]
    fn preference_replaces_fallback() {
        let table = StrategyTable::default();
        let strategy = table
            .get(ErrorKind::ElementNotFound)
            .with_preference(OnError::Stop, None);
        assert_eq!(strategy.action, RecoveryAction::Retry);
        assert_eq!(strategy.fallback, RecoveryAction::Stop);

        let script = table.get(ErrorKind::Script).with_preference(OnError::Continue, None);
        assert_eq!(script.action, RecoveryAction::Continue);
    }

    #[test]
    fn retry_preference_forces_retries() {
        let table = StrategyTable::default();
        let strategy = table.get(ErrorKind::Script).with_preference(OnError::Retry, Some(2));
        assert_eq!(strategy.action, RecoveryAction::Retry);
        assert_eq!(strategy.max_retries, 2);
        assert_eq!(strategy.fallback, RecoveryAction::Skip);
    }

    #[test]
    fn on_error_parses_aliases() {
        assert_eq!("".parse::<OnError>().unwrap(), OnError::Auto);
        assert_eq!("Abort".parse::<OnError>().unwrap(), OnError::Stop);
        assert!("explode".parse::<OnError>().is_err());
    }
}
