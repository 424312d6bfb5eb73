use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use browserflow_core_types::SessionTarget;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::EnvironmentError;

/// An open browser session issued for one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
    pub target: SessionTarget,
    pub opened_at: DateTime<Utc>,
    /// Provider-specific details (debugger address, profile path, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub target: SessionTarget,
    pub open_sessions: usize,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Issues and reclaims browser sessions for task targets.
///
/// Implementations usually front a remote profile service with its own
/// retry/backoff; the scheduler calls them only at task start and end.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn acquire_session(&self, target: &SessionTarget) -> Result<SessionHandle, EnvironmentError>;

    async fn release_session(&self, session: SessionHandle) -> Result<(), EnvironmentError>;

    async fn session_info(&self, target: &SessionTarget) -> Result<SessionInfo, EnvironmentError>;

    /// Best-effort reachability check.
    async fn test_connectivity(&self) -> bool {
        true
    }
}

/// Serves a fixed set of registered targets from memory.
#[derive(Debug, Default)]
pub struct StaticEnvironmentProvider {
    targets: DashMap<SessionTarget, Map<String, Value>>,
    open: DashMap<String, SessionTarget>,
    accept_any: bool,
    offline: AtomicBool,
    next_session: AtomicU64,
    peak_open: AtomicUsize,
}

impl StaticEnvironmentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that issues sessions for any target, registered or not.
    pub fn permissive() -> Self {
        Self {
            accept_any: true,
            ..Self::default()
        }
    }

    pub fn register(&self, target: SessionTarget, metadata: Map<String, Value>) {
        self.targets.insert(target, metadata);
    }

    pub fn with_target(self, target: impl Into<String>) -> Self {
        self.register(SessionTarget::new(target), Map::new());
        self
    }

    /// Simulate the backing service going away.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn open_sessions(&self) -> usize {
        self.open.len()
    }

    /// Highest number of sessions that were open at the same time.
    pub fn peak_open_sessions(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<(), EnvironmentError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EnvironmentError::Unavailable(
                "static provider is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn metadata_of(&self, target: &SessionTarget) -> Result<Map<String, Value>, EnvironmentError> {
        match self.targets.get(target) {
            Some(entry) => Ok(entry.value().clone()),
            None if self.accept_any => Ok(Map::new()),
            None => Err(EnvironmentError::UnknownTarget(target.clone())),
        }
    }
}

#[async_trait]
impl EnvironmentProvider for StaticEnvironmentProvider {
    async fn acquire_session(&self, target: &SessionTarget) -> Result<SessionHandle, EnvironmentError> {
        self.ensure_online()?;
        let metadata = self.metadata_of(target)?;
        let seq = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{target}-{seq}");
        self.open.insert(id.clone(), target.clone());
        self.peak_open.fetch_max(self.open.len(), Ordering::SeqCst);
        debug!(target_id = %target, session = %id, "session acquired");
        Ok(SessionHandle {
            id,
            target: target.clone(),
            opened_at: Utc::now(),
            metadata,
        })
    }

    async fn release_session(&self, session: SessionHandle) -> Result<(), EnvironmentError> {
        match self.open.remove(&session.id) {
            Some(_) => {
                debug!(session = %session.id, "session released");
                Ok(())
            }
            None => Err(EnvironmentError::UnknownSession(session.id)),
        }
    }

    async fn session_info(&self, target: &SessionTarget) -> Result<SessionInfo, EnvironmentError> {
        self.ensure_online()?;
        let metadata = self.metadata_of(target)?;
        let open_sessions = self
            .open
            .iter()
            .filter(|entry| entry.value() == target)
            .count();
        Ok(SessionInfo {
            target: target.clone(),
            open_sessions,
            metadata,
        })
    }

    async fn test_connectivity(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}
