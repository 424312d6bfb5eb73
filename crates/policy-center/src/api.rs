use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::PolicyError;
use crate::model::{PolicySnapshot, PolicySource, PolicyView, RuntimeOverrideSpec};
use crate::override_store::OverrideStore;

#[async_trait]
pub trait PolicyCenter: Send + Sync {
    async fn snapshot(&self) -> Arc<PolicySnapshot>;
    async fn view(&self) -> PolicyView;
    async fn apply_override(&self, override_spec: RuntimeOverrideSpec) -> Result<(), PolicyError>;
    async fn clear_override(&self, path: &str) -> Result<bool, PolicyError>;
    fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>>;
    async fn guard(&self) -> PolicyGuard;
}

struct PolicyState {
    base: PolicySnapshot,
    snapshot: PolicySnapshot,
    overrides: OverrideStore,
    rev_counter: u64,
}

impl PolicyState {
    fn new(base: PolicySnapshot) -> Self {
        let rev_counter = base.rev;
        Self {
            base: base.clone(),
            snapshot: base,
            overrides: OverrideStore::default(),
            rev_counter,
        }
    }

    fn rebuild(&mut self) -> Result<(), PolicyError> {
        let mut next = self.base.clone();
        for (path, value) in self.overrides.active_entries() {
            apply_override_to_snapshot(&mut next, &path, &value, PolicySource::RuntimeOverride)?;
        }
        self.rev_counter = self.rev_counter.saturating_add(1);
        next.rev = self.rev_counter;
        self.snapshot = next;
        Ok(())
    }
}

pub struct InMemoryPolicyCenter {
    state: Arc<Mutex<PolicyState>>,
    watch_tx: watch::Sender<Arc<PolicySnapshot>>,
}

impl InMemoryPolicyCenter {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        let state = PolicyState::new(snapshot);
        let current = Arc::new(state.snapshot.clone());
        let (watch_tx, _watch_rx) = watch::channel(current);
        Self {
            state: Arc::new(Mutex::new(state)),
            watch_tx,
        }
    }

    fn publish(&self, snapshot: Arc<PolicySnapshot>) {
        // send_replace keeps the latest value even with no live receivers
        self.watch_tx.send_replace(snapshot);
    }
}

#[async_trait]
impl PolicyCenter for InMemoryPolicyCenter {
    async fn snapshot(&self) -> Arc<PolicySnapshot> {
        let guard = self.state.lock().await;
        Arc::new(guard.snapshot.clone())
    }

    async fn view(&self) -> PolicyView {
        let guard = self.state.lock().await;
        PolicyView::from(guard.snapshot.clone())
    }

    async fn apply_override(&self, override_spec: RuntimeOverrideSpec) -> Result<(), PolicyError> {
        let ttl = (override_spec.ttl_seconds > 0)
            .then(|| Duration::from_secs(override_spec.ttl_seconds));

        let mut guard = self.state.lock().await;
        // reject bad paths before they land in the store
        let mut candidate = guard.snapshot.clone();
        apply_override_to_snapshot(
            &mut candidate,
            &override_spec.path,
            &override_spec.value,
            PolicySource::RuntimeOverride,
        )?;
        guard
            .overrides
            .insert(override_spec.path.clone(), override_spec.value.clone(), ttl);
        guard.rebuild()?;
        let snapshot = Arc::new(guard.snapshot.clone());
        drop(guard);
        debug!(
            path = %override_spec.path,
            owner = %override_spec.owner,
            reason = %override_spec.reason,
            "policy override applied"
        );
        self.publish(snapshot);

        if let Some(ttl) = ttl {
            let state = Arc::clone(&self.state);
            let watch_tx = self.watch_tx.clone();
            let path = override_spec.path;
            tokio::spawn(async move {
                sleep(ttl).await;
                let mut guard = state.lock().await;
                if !guard.overrides.remove(&path) {
                    return;
                }
                match guard.rebuild() {
                    Ok(()) => {
                        let snapshot = Arc::new(guard.snapshot.clone());
                        drop(guard);
                        watch_tx.send_replace(snapshot);
                    }
                    Err(err) => warn!("policy override expiry recompute failed: {err}"),
                }
            });
        }

        Ok(())
    }

    async fn clear_override(&self, path: &str) -> Result<bool, PolicyError> {
        let mut guard = self.state.lock().await;
        if !guard.overrides.remove(path) {
            return Ok(false);
        }
        guard.rebuild()?;
        let snapshot = Arc::new(guard.snapshot.clone());
        drop(guard);
        self.publish(snapshot);
        Ok(true)
    }

    fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>> {
        self.watch_tx.subscribe()
    }

    async fn guard(&self) -> PolicyGuard {
        let snapshot = self.snapshot().await;
        PolicyGuard { snapshot }
    }
}

/// Sticky view of one revision, for callers that must not observe a change mid-operation.
#[derive(Clone, Debug)]
pub struct PolicyGuard {
    snapshot: Arc<PolicySnapshot>,
}

impl PolicyGuard {
    pub fn revision(&self) -> u64 {
        self.snapshot.rev
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn view(&self) -> PolicyView {
        PolicyView::from((*self.snapshot).clone())
    }
}

/// Sets one dotted leaf path (e.g. `scheduler.worker_count`) on the snapshot.
///
/// The new value must have the same JSON shape as the current one: numbers
/// replace numbers, booleans replace booleans, strings replace strings.
pub(crate) fn apply_override_to_snapshot(
    snapshot: &mut PolicySnapshot,
    path: &str,
    value: &Value,
    source: PolicySource,
) -> Result<(), PolicyError> {
    let (section, rest) = path
        .split_once('.')
        .ok_or_else(|| PolicyError::UnsupportedPath(path.to_string()))?;

    let mut tree = match section {
        "scheduler" => to_tree(&snapshot.scheduler)?,
        "interpreter" => to_tree(&snapshot.interpreter)?,
        "recovery" => to_tree(&snapshot.recovery)?,
        "variables" => to_tree(&snapshot.variables)?,
        "logging" => to_tree(&snapshot.logging)?,
        _ => return Err(PolicyError::UnsupportedPath(path.to_string())),
    };

    let mut cursor = &mut tree;
    for segment in rest.split('.') {
        cursor = cursor
            .get_mut(segment)
            .ok_or_else(|| PolicyError::UnsupportedPath(path.to_string()))?;
    }
    let coerced = coerce_like(cursor, value)
        .ok_or_else(|| PolicyError::InvalidValue(format!("{path}: incompatible value {value}")))?;
    let changed = *cursor != coerced;
    *cursor = coerced;

    match section {
        "scheduler" => snapshot.scheduler = from_tree(tree)?,
        "interpreter" => snapshot.interpreter = from_tree(tree)?,
        "recovery" => snapshot.recovery = from_tree(tree)?,
        "variables" => snapshot.variables = from_tree(tree)?,
        _ => snapshot.logging = from_tree(tree)?,
    }
    if changed || source == PolicySource::Builtin {
        snapshot.set_provenance(path, source);
    }
    Ok(())
}

fn coerce_like(current: &Value, candidate: &Value) -> Option<Value> {
    match current {
        Value::Object(_) | Value::Array(_) => None,
        Value::Bool(_) => match candidate {
            Value::Bool(flag) => Some(Value::Bool(*flag)),
            Value::String(raw) => raw.parse::<bool>().ok().map(Value::Bool),
            _ => None,
        },
        Value::Number(_) => match candidate {
            Value::Number(num) if num.as_u64().is_some() => Some(candidate.clone()),
            Value::String(raw) => raw.trim().parse::<u64>().ok().map(Value::from),
            _ => None,
        },
        Value::String(_) => match candidate {
            Value::String(_) => Some(candidate.clone()),
            Value::Number(num) => Some(Value::String(num.to_string())),
            _ => None,
        },
        Value::Null => Some(candidate.clone()),
    }
}

fn to_tree<T: serde::Serialize>(section: &T) -> Result<Value, PolicyError> {
    serde_json::to_value(section).map_err(|err| PolicyError::Invalid(err.to_string()))
}

fn from_tree<T: serde::de::DeserializeOwned>(tree: Value) -> Result<T, PolicyError> {
    serde_json::from_value(tree).map_err(|err| PolicyError::InvalidValue(err.to_string()))
}
