use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use action_flow::{ExecutionResult, Flow, Progress};
use browserflow_core_types::{SessionTarget, TaskId};
use browserflow_policy_center::PolicyView;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SchedulerError;
use crate::model::{
    SchedulerConfig, SchedulerStatistics, TaskPriority, TaskSnapshot, TaskStatus,
};
use crate::queue::TaskQueue;

pub type CompletionCallback = Arc<dyn Fn(&TaskSnapshot) + Send + Sync>;

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    /// Order in which tasks reached a terminal status
    finish_seq: Option<u64>,
    progress: u8,
    current_step_index: Option<usize>,
    result: Option<ExecutionResult>,
    error: Option<String>,
}

/// One submitted task. Only the worker running it and cancellation requests
/// mutate its state.
#[derive(Debug)]
pub struct TaskRecord {
    pub id: TaskId,
    pub target: SessionTarget,
    pub flow: Arc<Flow>,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    state: Mutex<TaskState>,
    /// Set once the terminal transition, callbacks included, is complete
    settled: AtomicBool,
    done: Notify,
}

impl TaskRecord {
    fn new(target: SessionTarget, flow: Arc<Flow>, priority: TaskPriority) -> Self {
        Self {
            id: TaskId::new(),
            target,
            flow,
            priority,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                started_at: None,
                finished_at: None,
                finish_seq: None,
                progress: 0,
                current_step_index: None,
                result: None,
                error: None,
            }),
            settled: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock();
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &TaskState) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            target: self.target.clone(),
            flow_name: self.flow.name.clone(),
            priority: self.priority,
            status: state.status,
            created_at: self.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            progress: state.progress,
            current_step_index: state.current_step_index,
            total_steps: self.flow.steps.len(),
            result: state.result.clone(),
            error: state.error.clone(),
        }
    }

    /// pending -> running; false when the task already left `pending`.
    fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Pending {
            return false;
        }
        state.status = TaskStatus::Running;
        state.started_at = Some(Utc::now());
        true
    }

    pub fn update_progress(&self, progress: Progress) {
        let mut state = self.state.lock();
        if state.status == TaskStatus::Running {
            state.progress = progress.percent.min(100);
            state.current_step_index = Some(progress.step_index);
        }
    }

    /// Resolves once the task reaches a terminal status.
    pub async fn finished(&self) -> TaskSnapshot {
        loop {
            let notified = self.done.notified();
            if self.settled.load(Ordering::SeqCst) {
                return self.snapshot();
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    finished: AtomicU64,
}

impl Counters {
    fn record_terminal(&self, status: TaskStatus) {
        let counter = match status {
            TaskStatus::Completed => &self.completed,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Cancelled => &self.cancelled,
            TaskStatus::Pending | TaskStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared scheduler state. The queue mutex is the single coordination point
/// between submitters, cancellers and workers.
pub struct SchedulerRuntime {
    queue: Mutex<TaskQueue>,
    tasks: DashMap<TaskId, Arc<TaskRecord>>,
    config: RwLock<SchedulerConfig>,
    policy: RwLock<PolicyView>,
    callbacks: RwLock<Vec<CompletionCallback>>,
    counters: Counters,
    running: AtomicUsize,
    paused: AtomicBool,
    accepting: AtomicBool,
    pub(crate) generation: AtomicU64,
    pub(crate) wake: Notify,
    pub(crate) idle: Notify,
}

impl SchedulerRuntime {
    pub fn new(policy: PolicyView) -> Self {
        let config = SchedulerConfig::from(&policy.scheduler);
        Self {
            queue: Mutex::new(TaskQueue::new(config.queue_capacity)),
            tasks: DashMap::new(),
            config: RwLock::new(config),
            policy: RwLock::new(policy),
            callbacks: RwLock::new(Vec::new()),
            counters: Counters::default(),
            running: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            wake: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config.read().clone()
    }

    pub fn policy(&self) -> PolicyView {
        self.policy.read().clone()
    }

    /// Installs a new policy; returns the previous worker count.
    /// Returns the worker count before and after. A manual worker count
    /// survives policies that leave `scheduler.worker_count` unchanged.
    pub fn set_policy(&self, policy: PolicyView) -> (usize, usize) {
        let mut next = SchedulerConfig::from(&policy.scheduler);
        let mut current = self.policy.write();
        let previous = {
            let mut config = self.config.write();
            let previous = config.worker_count;
            if current.scheduler.worker_count == policy.scheduler.worker_count {
                next.worker_count = previous;
            }
            *config = next.clone();
            previous
        };
        self.queue.lock().set_capacity(next.queue_capacity);
        *current = policy;
        (previous, next.worker_count)
    }

    pub fn set_worker_count(&self, count: usize) {
        self.config.write().worker_count = count;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn add_callback(&self, callback: CompletionCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn enqueue(
        &self,
        target: SessionTarget,
        flow: Arc<Flow>,
        priority: TaskPriority,
    ) -> Result<Arc<TaskRecord>, SchedulerError> {
        if !self.is_accepting() {
            return Err(SchedulerError::ShuttingDown);
        }
        let record = Arc::new(TaskRecord::new(target, flow, priority));
        {
            let mut queue = self.queue.lock();
            queue.push(record.id.clone(), priority)?;
            self.tasks.insert(record.id.clone(), Arc::clone(&record));
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    pub fn record(&self, id: &TaskId) -> Option<Arc<TaskRecord>> {
        self.tasks.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Pops the next dispatchable task and marks it running, honouring pause
    /// and the worker bound.
    pub fn claim_next(&self) -> Option<Arc<TaskRecord>> {
        if self.is_paused() || !self.is_accepting() {
            return None;
        }
        let limit = self.config.read().worker_count;
        let mut queue = self.queue.lock();
        if self.running.load(Ordering::SeqCst) >= limit {
            return None;
        }
        while let Some(queued) = queue.pop() {
            let Some(record) = self.record(&queued.id) else {
                continue;
            };
            if record.cancel.is_cancelled() {
                drop(queue);
                self.complete(&record, TaskStatus::Cancelled, None, Some("cancelled before start".into()));
                queue = self.queue.lock();
                continue;
            }
            if record.start() {
                self.running.fetch_add(1, Ordering::SeqCst);
                return Some(record);
            }
        }
        None
    }

    /// Called by a worker once it no longer holds a task.
    pub fn release_slot(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
        self.wake.notify_waiters();
    }

    /// Removes `id` from the queue if it has not been dispatched yet.
    pub fn dequeue(&self, id: &TaskId) -> bool {
        self.queue.lock().remove(id)
    }

    pub fn drain_queue(&self) -> Vec<Arc<TaskRecord>> {
        let drained = self.queue.lock().drain();
        drained
            .into_iter()
            .filter_map(|queued| self.record(&queued.id))
            .collect()
    }

    pub fn running_tasks(&self) -> Vec<Arc<TaskRecord>> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().status() == TaskStatus::Running)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Moves a task to a terminal status exactly once, firing completion
    /// callbacks. Returns false when the task had already finished.
    pub fn complete(
        &self,
        record: &TaskRecord,
        status: TaskStatus,
        result: Option<ExecutionResult>,
        error: Option<String>,
    ) -> bool {
        let snapshot = {
            let mut state = record.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.finished_at = Some(Utc::now());
            state.finish_seq = Some(self.counters.finished.fetch_add(1, Ordering::Relaxed));
            if status == TaskStatus::Completed {
                state.progress = 100;
            }
            state.result = result;
            state.error = error;
            record.snapshot_of(&state)
        };
        self.counters.record_terminal(status);
        info!(
            task_id = %record.id,
            flow = %snapshot.flow_name,
            status = %status,
            error = snapshot.error.as_deref().unwrap_or(""),
            "task finished"
        );

        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(&snapshot);
        }
        record.settled.store(true, Ordering::SeqCst);
        record.done.notify_waiters();
        self.purge_finished();
        true
    }

    /// Evicts finished tasks past the retention limits, oldest first.
    pub fn purge_finished(&self) -> usize {
        let retention = self.config.read().retention.clone();
        let max_age = chrono::Duration::from_std(retention.max_age).ok();
        let now = Utc::now();

        let mut finished: Vec<(u64, DateTime<Utc>, TaskId)> = self
            .tasks
            .iter()
            .filter_map(|entry| {
                let record = entry.value();
                let state = record.state.lock();
                let seq = state.finish_seq?;
                let finished_at = state.finished_at.unwrap_or(record.created_at);
                Some((seq, finished_at, record.id.clone()))
            })
            .collect();
        finished.sort_by_key(|(seq, _, _)| *seq);

        let excess = finished.len().saturating_sub(retention.max_finished);
        let mut evicted = 0;
        for (index, (_, finished_at, id)) in finished.into_iter().enumerate() {
            let expired = max_age.is_some_and(|age| now - finished_at > age);
            if index < excess || expired {
                self.tasks.remove(&id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "finished tasks evicted");
        }
        evicted
    }

    pub fn all_status(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .tasks
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        SchedulerStatistics {
            total: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            running: self.running(),
            queued: self.queue.lock().len(),
            workers: self.config.read().worker_count,
            paused: self.is_paused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_flow::Step;
    use browserflow_policy_center::default_snapshot;

    fn runtime_with(configure: impl FnOnce(&mut PolicyView)) -> SchedulerRuntime {
        let mut policy = PolicyView::from(default_snapshot());
        configure(&mut policy);
        SchedulerRuntime::new(policy)
    }

    fn flow(name: &str) -> Arc<Flow> {
        Arc::new(Flow::new(name).with_step(Step::new("s1", "navigate").with_param("url", "https://a.test")))
    }

    #[test]
    fn test_claim_respects_worker_bound() {
        let runtime = runtime_with(|policy| policy.scheduler.worker_count = 1);
        runtime.enqueue(SessionTarget::new("t"), flow("a"), TaskPriority::Normal).unwrap();
        runtime.enqueue(SessionTarget::new("t"), flow("b"), TaskPriority::Normal).unwrap();

        let first = runtime.claim_next().unwrap();
        assert_eq!(first.status(), TaskStatus::Running);
        assert!(runtime.claim_next().is_none());

        runtime.complete(&first, TaskStatus::Completed, None, None);
        runtime.release_slot();
        let second = runtime.claim_next().unwrap();
        assert_eq!(second.flow.name, "b");
    }

    #[test]
    fn test_paused_runtime_dispatches_nothing() {
        let runtime = runtime_with(|_| {});
        runtime.enqueue(SessionTarget::new("t"), flow("a"), TaskPriority::Normal).unwrap();
        runtime.set_paused(true);
        assert!(runtime.claim_next().is_none());
        runtime.set_paused(false);
        assert!(runtime.claim_next().is_some());
    }

    #[test]
    fn test_complete_fires_callbacks_once() {
        let runtime = runtime_with(|_| {});
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        runtime.add_callback(Arc::new(move |snapshot: &TaskSnapshot| {
            sink.lock().push(snapshot.status);
        }));

        let record = runtime
            .enqueue(SessionTarget::new("t"), flow("a"), TaskPriority::Normal)
            .unwrap();
        assert!(runtime.complete(&record, TaskStatus::Failed, None, Some("boom".into())));
        assert!(!runtime.complete(&record, TaskStatus::Completed, None, None));

        assert_eq!(*seen.lock(), vec![TaskStatus::Failed]);
        assert_eq!(runtime.statistics().failed, 1);
        assert_eq!(runtime.statistics().completed, 0);
    }

    #[test]
    fn test_retention_keeps_newest_finished() {
        let runtime = runtime_with(|policy| policy.scheduler.retention.max_finished = 2);
        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let record = runtime
                .enqueue(SessionTarget::new("t"), flow(name), TaskPriority::Normal)
                .unwrap();
            runtime.dequeue(&record.id);
            runtime.complete(&record, TaskStatus::Completed, None, None);
            ids.push(record.id.clone());
        }

        assert!(runtime.record(&ids[0]).is_none());
        assert!(runtime.record(&ids[1]).is_none());
        assert!(runtime.record(&ids[3]).is_some());
        assert_eq!(runtime.all_status().len(), 2);
        assert_eq!(runtime.statistics().total, 4);
    }

    #[test]
    fn test_cancelled_record_is_skipped_at_claim() {
        let runtime = runtime_with(|_| {});
        let record = runtime
            .enqueue(SessionTarget::new("t"), flow("a"), TaskPriority::Normal)
            .unwrap();
        record.cancel.cancel();
        assert!(runtime.claim_next().is_none());
        assert_eq!(record.status(), TaskStatus::Cancelled);
        assert!(record.snapshot().started_at.is_none());
    }
}
