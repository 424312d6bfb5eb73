//! Host facade tying the policy center to the scheduler

use std::sync::Arc;
use std::time::Duration;

use action_flow::Flow;
use browserflow_core_types::{SessionTarget, TaskId};
use browserflow_policy_center::{
    InMemoryPolicyCenter, PolicyCenter, PolicySnapshot, PolicyView, RuntimeOverrideSpec,
};
use browserflow_scheduler::{
    ActuatorFactory, EnvironmentProvider, SchedulerStatistics, ShutdownReport, TaskPriority,
    TaskScheduler, TaskSnapshot, TaskStatus,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::errors::EngineError;

/// Single entry point for hosts: owns the live policy and the scheduler.
pub struct Engine {
    policy: Arc<InMemoryPolicyCenter>,
    scheduler: TaskScheduler,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        snapshot: PolicySnapshot,
        provider: Arc<dyn EnvironmentProvider>,
        actuators: Arc<dyn ActuatorFactory>,
    ) -> Self {
        let view = PolicyView::from(snapshot.clone());
        Self {
            policy: Arc::new(InMemoryPolicyCenter::new(snapshot)),
            scheduler: TaskScheduler::new(view, provider, actuators),
            watcher: Mutex::new(None),
        }
    }

    /// Starts the workers and begins following policy changes.
    /// Must run inside a tokio runtime.
    pub fn start(&self) {
        self.scheduler.start();
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }
        let mut updates = self.policy.subscribe();
        let scheduler = self.scheduler.clone();
        *watcher = Some(tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let snapshot = updates.borrow_and_update().clone();
                debug!(rev = snapshot.rev, "policy revision applied");
                scheduler.apply_policy(PolicyView::from((*snapshot).clone()));
            }
        }));
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn policy_center(&self) -> Arc<InMemoryPolicyCenter> {
        Arc::clone(&self.policy)
    }

    pub fn submit_task(
        &self,
        target: impl Into<String>,
        flow: Flow,
        priority: TaskPriority,
    ) -> Result<TaskId, EngineError> {
        Ok(self
            .scheduler
            .submit(SessionTarget::new(target), flow, priority)?)
    }

    pub fn cancel_task(&self, id: &TaskId) -> Result<TaskStatus, EngineError> {
        Ok(self.scheduler.cancel(id)?)
    }

    pub fn pause_all(&self) {
        self.scheduler.pause();
    }

    pub fn resume_all(&self) {
        self.scheduler.resume();
    }

    pub fn set_worker_count(&self, count: usize) -> Result<(), EngineError> {
        Ok(self.scheduler.set_worker_count(count)?)
    }

    pub fn task_status(&self, id: &TaskId) -> Result<TaskSnapshot, EngineError> {
        Ok(self.scheduler.status(id)?)
    }

    pub fn all_tasks_status(&self) -> Vec<TaskSnapshot> {
        self.scheduler.all_status()
    }

    pub fn scheduler_statistics(&self) -> SchedulerStatistics {
        self.scheduler.statistics()
    }

    pub async fn wait_for_task(&self, id: &TaskId) -> Result<TaskSnapshot, EngineError> {
        Ok(self.scheduler.wait(id).await?)
    }

    /// Applies a runtime override; the scheduler picks it up through the watcher.
    pub async fn apply_override(&self, spec: RuntimeOverrideSpec) -> Result<(), EngineError> {
        info!(path = %spec.path, owner = %spec.owner, "runtime policy override");
        Ok(self.policy.apply_override(spec).await?)
    }

    pub async fn policy_snapshot(&self) -> Arc<PolicySnapshot> {
        self.policy.snapshot().await
    }

    /// Shuts the scheduler down using the policy's shutdown timeout.
    pub async fn shutdown(&self) -> ShutdownReport {
        let deadline = self.scheduler.config().shutdown_timeout;
        self.shutdown_within(deadline).await
    }

    pub async fn shutdown_within(&self, deadline: Duration) -> ShutdownReport {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.scheduler.shutdown(deadline).await
    }
}
