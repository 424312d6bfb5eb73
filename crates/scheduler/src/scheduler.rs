use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use action_flow::{ExecutionResult, Flow, FlowInterpreter, InterpreterLimits};
use browserflow_core_types::{SessionTarget, TaskId};
use browserflow_execution_log::{ExecutionLogger, LoggerConfig};
use browserflow_policy_center::PolicyView;
use browserflow_variables::{Scope, VariableStore};
use exception_policy::ExceptionPolicy;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::environment::{EnvironmentProvider, SessionHandle};
use crate::error::SchedulerError;
use crate::executor::ActuatorFactory;
use crate::model::{SchedulerConfig, SchedulerStatistics, TaskPriority, TaskSnapshot, TaskStatus};
use crate::runtime::{CompletionCallback, SchedulerRuntime, TaskRecord};

/// What `shutdown` had to cut short.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Queued tasks cancelled without running
    pub cancelled_queued: usize,
    /// Running tasks still unfinished at the deadline
    pub abandoned_running: usize,
}

struct Shared {
    runtime: SchedulerRuntime,
    provider: Arc<dyn EnvironmentProvider>,
    actuators: Arc<dyn ActuatorFactory>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Priority queue plus a bounded pool of tokio workers, each running one
/// task's flow end to end.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl TaskScheduler {
    pub fn new(
        policy: PolicyView,
        provider: Arc<dyn EnvironmentProvider>,
        actuators: Arc<dyn ActuatorFactory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime: SchedulerRuntime::new(policy),
                provider,
                actuators,
                workers: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns the worker pool. Must be called inside a tokio runtime;
    /// `submit` calls it on first use.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.shared.runtime.config().worker_count;
        spawn_workers(&self.shared, count);
    }

    /// Queues `flow` for `target`. Never waits for capacity.
    pub fn submit(
        &self,
        target: SessionTarget,
        flow: Flow,
        priority: TaskPriority,
    ) -> Result<TaskId, SchedulerError> {
        flow.validate()
            .map_err(|err| SchedulerError::InvalidFlow(err.to_string()))?;
        self.start();
        let record = self
            .shared
            .runtime
            .enqueue(target, Arc::new(flow), priority)?;
        debug!(task_id = %record.id, priority = %priority, "task queued");
        self.shared.runtime.wake.notify_waiters();
        Ok(record.id.clone())
    }

    /// Cancels a task and returns its status after the request.
    ///
    /// Queued tasks become `cancelled` immediately and are never dispatched.
    /// Running tasks keep `running` until the interpreter notices the signal
    /// at the next step boundary. Finished tasks are left untouched.
    pub fn cancel(&self, id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        let runtime = &self.shared.runtime;
        let record = runtime
            .record(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        if record.status().is_terminal() {
            return Ok(record.status());
        }
        record.cancel.cancel();
        if runtime.dequeue(id) {
            runtime.complete(&record, TaskStatus::Cancelled, None, Some("cancelled before start".into()));
            info!(task_id = %id, "queued task cancelled");
        } else {
            info!(task_id = %id, "cancellation signalled to running task");
        }
        Ok(record.status())
    }

    pub fn pause(&self) {
        self.shared.runtime.set_paused(true);
        info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.shared.runtime.set_paused(false);
        self.shared.runtime.wake.notify_waiters();
        info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.runtime.is_paused()
    }

    /// Replaces the worker pool. Running tasks finish on their old workers,
    /// which then exit; the new pool takes over the queue.
    pub fn set_worker_count(&self, count: usize) -> Result<(), SchedulerError> {
        if count == 0 {
            return Err(SchedulerError::InvalidWorkerCount);
        }
        if !self.shared.runtime.is_accepting() {
            return Err(SchedulerError::ShuttingDown);
        }
        self.shared.runtime.set_worker_count(count);
        if self.shared.started.load(Ordering::SeqCst) {
            spawn_workers(&self.shared, count);
        }
        info!(workers = count, "worker count changed");
        Ok(())
    }

    /// Installs a new policy for tasks dispatched from now on.
    pub fn apply_policy(&self, policy: PolicyView) {
        let (previous, workers) = self.shared.runtime.set_policy(policy);
        if previous != workers && self.shared.started.load(Ordering::SeqCst) {
            spawn_workers(&self.shared, workers);
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.shared.runtime.config()
    }

    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(&TaskSnapshot) + Send + Sync + 'static,
    {
        let callback: CompletionCallback = Arc::new(callback);
        self.shared.runtime.add_callback(callback);
    }

    pub fn status(&self, id: &TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.shared
            .runtime
            .record(id)
            .map(|record| record.snapshot())
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))
    }

    pub fn all_status(&self) -> Vec<TaskSnapshot> {
        self.shared.runtime.all_status()
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        self.shared.runtime.statistics()
    }

    pub fn purge_finished(&self) -> usize {
        self.shared.runtime.purge_finished()
    }

    /// Waits until the task reaches a terminal status.
    pub async fn wait(&self, id: &TaskId) -> Result<TaskSnapshot, SchedulerError> {
        let record = self
            .shared
            .runtime
            .record(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        Ok(record.finished().await)
    }

    /// Stops intake, cancels the queue, signals running tasks and waits for
    /// them up to `deadline`. Tasks still running afterwards are marked
    /// cancelled and their workers are left to wind down on their own.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let runtime = &self.shared.runtime;
        runtime.stop_accepting();

        let queued = runtime.drain_queue();
        for record in &queued {
            record.cancel.cancel();
            runtime.complete(record, TaskStatus::Cancelled, None, Some("scheduler shut down".into()));
        }

        let running = runtime.running_tasks();
        for record in &running {
            record.cancel.cancel();
        }

        let drained = tokio::time::timeout(deadline, async {
            loop {
                let idle = runtime.idle.notified();
                if runtime.running() == 0 {
                    break;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        let mut abandoned = 0;
        if !drained {
            for record in &running {
                if runtime.complete(
                    record,
                    TaskStatus::Cancelled,
                    None,
                    Some("shutdown deadline exceeded".into()),
                ) {
                    abandoned += 1;
                }
            }
            warn!(abandoned, "shutdown deadline exceeded with tasks still running");
        }

        runtime.generation.fetch_add(1, Ordering::SeqCst);
        runtime.wake.notify_waiters();
        self.shared.workers.lock().clear();
        info!(cancelled_queued = queued.len(), abandoned, "scheduler shut down");

        ShutdownReport {
            cancelled_queued: queued.len(),
            abandoned_running: abandoned,
        }
    }
}

fn spawn_workers(shared: &Arc<Shared>, count: usize) {
    let generation = shared.runtime.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let mut workers = shared.workers.lock();
    workers.retain(|handle| !handle.is_finished());
    for worker in 0..count {
        let shared = Arc::clone(shared);
        workers.push(tokio::spawn(worker_loop(shared, worker, generation)));
    }
    drop(workers);
    // idle workers of the previous generation wake up and exit
    shared.runtime.wake.notify_waiters();
    debug!(workers = count, generation, "worker pool spawned");
}

async fn worker_loop(shared: Arc<Shared>, worker: usize, generation: u64) {
    let runtime = &shared.runtime;
    loop {
        let wake = runtime.wake.notified();
        if runtime.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        match runtime.claim_next() {
            Some(record) => {
                let run = AssertUnwindSafe(run_task(&shared, &record, worker));
                if let Err(panic) = run.catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    error!(task_id = %record.id, worker, panic = %message, "task run panicked");
                    runtime.complete(
                        &record,
                        TaskStatus::Failed,
                        None,
                        Some(format!("task panicked: {message}")),
                    );
                }
                runtime.release_slot();
            }
            None => wake.await,
        }
    }
    debug!(worker, generation, "worker exited");
}

async fn run_task(shared: &Shared, record: &Arc<TaskRecord>, worker: usize) {
    let runtime = &shared.runtime;
    info!(
        task_id = %record.id,
        target = %record.target,
        flow = %record.flow.name,
        worker,
        "task started"
    );

    let session = match shared.provider.acquire_session(&record.target).await {
        Ok(session) => session,
        Err(err) => {
            warn!(task_id = %record.id, error = %err, "session acquisition failed");
            runtime.complete(
                record,
                TaskStatus::Failed,
                None,
                Some(format!("session acquisition failed: {err}")),
            );
            return;
        }
    };

    let outcome = match AssertUnwindSafe(execute(shared, record, &session))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(task_id = %record.id, panic = %message, "flow execution panicked");
            Err(format!("task panicked: {message}"))
        }
    };

    let session_id = session.id.clone();
    if let Err(err) = shared.provider.release_session(session).await {
        warn!(task_id = %record.id, session = %session_id, error = %err, "session release failed");
    }

    match outcome {
        Ok(result) => {
            let status = if result.cancelled {
                TaskStatus::Cancelled
            } else if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            let error = result.error.clone();
            runtime.complete(record, status, Some(result), error);
        }
        Err(message) => {
            runtime.complete(record, TaskStatus::Failed, None, Some(message));
        }
    }
}

/// Builds the per-task collaborators and runs the interpreter.
async fn execute(
    shared: &Shared,
    record: &Arc<TaskRecord>,
    session: &SessionHandle,
) -> Result<ExecutionResult, String> {
    let actuator = shared
        .actuators
        .actuator_for(session)
        .await
        .map_err(|fault| format!("actuator binding failed: {fault}"))?;
    let policy = shared.runtime.policy();

    let logger = match ExecutionLogger::new(record.id.clone(), LoggerConfig::from(&policy.logging)) {
        Ok(logger) => logger,
        Err(err) => {
            warn!(task_id = %record.id, error = %err, "log mirror unavailable, keeping task log in memory");
            ExecutionLogger::in_memory(record.id.clone())
        }
    };
    let variables = VariableStore::from_policy(&policy.variables);
    seed_session(&variables, session);

    let progress_record = Arc::clone(record);
    let interpreter = FlowInterpreter::new(actuator)
        .with_variables(Arc::new(variables))
        .with_recovery(Arc::new(ExceptionPolicy::new(&policy.recovery)))
        .with_logger(Arc::new(logger))
        .with_limits(InterpreterLimits::from(&policy.interpreter))
        .with_cancel_token(record.cancel.clone())
        .on_progress(Arc::new(move |progress| progress_record.update_progress(progress)));

    let outcome = interpreter.run(&record.flow).await;
    let summary = interpreter.logger().finalize();

    match outcome {
        Ok(mut result) => {
            match summary {
                Ok(summary) => result.log_summary = Some(summary),
                Err(err) => warn!(task_id = %record.id, error = %err, "execution log finalize failed"),
            }
            Ok(result)
        }
        Err(err) => {
            if let Err(log_err) = summary {
                debug!(task_id = %record.id, error = %log_err, "execution log finalize failed");
            }
            Err(format!("flow rejected: {err}"))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Exposes the session to the flow through the environment scope.
fn seed_session(variables: &VariableStore, session: &SessionHandle) {
    let mut entries = vec![
        ("session_id".to_string(), serde_json::Value::from(session.id.clone())),
        ("target_id".to_string(), serde_json::Value::from(session.target.0.clone())),
    ];
    entries.extend(session.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (name, value) in entries {
        if let Err(err) = variables.set(&name, value, Scope::Environment) {
            debug!(variable = %name, error = %err, "session variable skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::StaticEnvironmentProvider;
    use crate::executor::{FnActuatorFactory, SharedActuator};
    use action_flow::Step;
    use action_primitives::{Actuator, ScriptedActuator, ScriptedElement};
    use browserflow_policy_center::default_snapshot;
    use std::sync::atomic::AtomicUsize;

    fn policy(workers: usize, capacity: usize) -> PolicyView {
        let mut policy = PolicyView::from(default_snapshot());
        policy.scheduler.worker_count = workers;
        policy.scheduler.queue_capacity = capacity;
        policy
    }

    fn nav_flow(name: &str, steps: usize) -> Flow {
        let mut flow = Flow::new(name);
        for i in 0..steps {
            flow = flow.with_step(
                Step::new(format!("nav{i}"), "navigate").with_param("url", format!("https://{name}.test/{i}")),
            );
        }
        flow
    }

    fn scheduler_with(
        policy: PolicyView,
        provider: Arc<StaticEnvironmentProvider>,
        latency: Option<Duration>,
    ) -> TaskScheduler {
        let factory = FnActuatorFactory::new(move |_session: &SessionHandle| {
            let actuator = ScriptedActuator::permissive();
            if let Some(latency) = latency {
                actuator.set_latency(latency);
            }
            Arc::new(actuator) as Arc<dyn Actuator>
        });
        TaskScheduler::new(policy, provider, Arc::new(factory))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submitted_flow_completes() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let actuator = Arc::new(ScriptedActuator::permissive());
        actuator.add_element("#go", ScriptedElement::with_text("Go"));
        let scheduler = TaskScheduler::new(
            policy(1, 8),
            provider.clone(),
            Arc::new(SharedActuator::new(actuator.clone())),
        );

        let flow = Flow::new("three")
            .with_step(Step::new("open", "navigate").with_param("url", "https://shop.test"))
            .with_step(Step::new("press", "click").with_param("selector", "#go"))
            .with_step(
                Step::new("read", "extract_text")
                    .with_param("selector", "#go")
                    .with_param("output_variable", "label"),
            );
        let id = scheduler
            .submit(SessionTarget::new("profile-1"), flow, TaskPriority::Normal)
            .unwrap();
        let snapshot = scheduler.wait(&id).await.unwrap();

        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.progress, 100);
        assert!(snapshot.started_at.is_some());
        let result = snapshot.result.unwrap();
        assert_eq!(result.completed_step_count, 3);
        assert_eq!(result.variables["label"], serde_json::json!("Go"));
        assert_eq!(result.variables["target_id"], serde_json::json!("profile-1"));
        assert!(result.log_summary.is_some());
        assert_eq!(provider.open_sessions(), 0);
        assert_eq!(scheduler.statistics().completed, 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(1, 2), provider, None);
        scheduler.pause();

        scheduler.submit(SessionTarget::new("t"), nav_flow("a", 1), TaskPriority::Normal).unwrap();
        scheduler.submit(SessionTarget::new("t"), nav_flow("b", 1), TaskPriority::Normal).unwrap();
        let err = scheduler
            .submit(SessionTarget::new("t"), nav_flow("c", 1), TaskPriority::Critical)
            .unwrap_err();

        assert_eq!(err, SchedulerError::QueueFull { capacity: 2 });
        let stats = scheduler.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.queued, 2);
        assert!(stats.paused);
    }

    #[tokio::test]
    async fn test_invalid_flow_is_rejected_at_submit() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(1, 2), provider, None);
        let flow = Flow::new("broken").with_step(Step::new("x", "end_loop"));
        let err = scheduler
            .submit(SessionTarget::new("t"), flow, TaskPriority::Normal)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidFlow(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_priority_then_fifo_dispatch_order() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(1, 16), provider, None);
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        scheduler.on_complete(move |snapshot| sink.lock().push(snapshot.flow_name.clone()));

        scheduler.pause();
        let mut ids = Vec::new();
        for (name, priority) in [
            ("low", TaskPriority::Low),
            ("normal-1", TaskPriority::Normal),
            ("critical", TaskPriority::Critical),
            ("normal-2", TaskPriority::Normal),
            ("high", TaskPriority::High),
        ] {
            ids.push(
                scheduler
                    .submit(SessionTarget::new("t"), nav_flow(name, 1), priority)
                    .unwrap(),
            );
        }
        scheduler.resume();
        for id in &ids {
            scheduler.wait(id).await.unwrap();
        }

        assert_eq!(
            *order.lock(),
            vec!["critical", "high", "normal-1", "normal-2", "low"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_queued_task_never_runs() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(1, 8), provider.clone(), None);
        scheduler.pause();
        let doomed = scheduler
            .submit(SessionTarget::new("t"), nav_flow("doomed", 2), TaskPriority::Critical)
            .unwrap();
        let kept = scheduler
            .submit(SessionTarget::new("t"), nav_flow("kept", 1), TaskPriority::Low)
            .unwrap();

        assert_eq!(scheduler.cancel(&doomed).unwrap(), TaskStatus::Cancelled);
        // cancelling twice is a no-op
        assert_eq!(scheduler.cancel(&doomed).unwrap(), TaskStatus::Cancelled);
        scheduler.resume();
        scheduler.wait(&kept).await.unwrap();

        let snapshot = scheduler.status(&doomed).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Cancelled);
        assert!(snapshot.started_at.is_none());
        assert!(snapshot.result.is_none());
        assert_eq!(provider.peak_open_sessions(), 1);
        assert_eq!(scheduler.statistics().cancelled, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_running_task_cancels_at_step_boundary() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(1, 8), provider.clone(), Some(Duration::from_millis(30)));
        let id = scheduler
            .submit(SessionTarget::new("t"), nav_flow("long", 20), TaskPriority::Normal)
            .unwrap();

        while scheduler.status(&id).unwrap().status != TaskStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(scheduler.cancel(&id).unwrap(), TaskStatus::Running);

        let snapshot = scheduler.wait(&id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Cancelled);
        let result = snapshot.result.unwrap();
        assert!(result.cancelled);
        assert!(result.step_results.len() < 20);
        assert_eq!(provider.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_session_failure_fails_task_without_running() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        provider.set_offline(true);
        let scheduler = scheduler_with(policy(1, 8), provider, None);
        let id = scheduler
            .submit(SessionTarget::new("t"), nav_flow("a", 1), TaskPriority::Normal)
            .unwrap();

        let snapshot = scheduler.wait(&id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot.result.is_none());
        assert!(snapshot.error.unwrap().contains("session acquisition failed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_stays_within_worker_bound() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(2, 4), provider.clone(), Some(Duration::from_millis(20)));
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        scheduler.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut accepted = Vec::new();
        let mut rejected = 0;
        for i in 0..30 {
            match scheduler.submit(SessionTarget::new("t"), nav_flow(&format!("b{i}"), 2), TaskPriority::Normal) {
                Ok(id) => accepted.push(id),
                Err(SchedulerError::QueueFull { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        for id in &accepted {
            assert_eq!(scheduler.wait(id).await.unwrap().status, TaskStatus::Completed);
        }

        assert!(rejected > 0);
        assert_eq!(accepted.len() + rejected, 30);
        assert!(provider.peak_open_sessions() <= 2);
        assert_eq!(completions.load(Ordering::SeqCst), accepted.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_count_change_keeps_bound() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(1, 32), provider.clone(), Some(Duration::from_millis(10)));
        scheduler.start();
        scheduler.set_worker_count(3).unwrap();
        assert_eq!(scheduler.statistics().workers, 3);
        assert_eq!(scheduler.set_worker_count(0), Err(SchedulerError::InvalidWorkerCount));

        let ids: Vec<_> = (0..9)
            .map(|i| {
                scheduler
                    .submit(SessionTarget::new("t"), nav_flow(&format!("w{i}"), 2), TaskPriority::Normal)
                    .unwrap()
            })
            .collect();
        for id in &ids {
            scheduler.wait(id).await.unwrap();
        }
        assert!(provider.peak_open_sessions() <= 3);
        assert_eq!(scheduler.statistics().completed, 9);
    }

    #[tokio::test]
    async fn test_policy_reload_keeps_manual_worker_count() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(1, 8), provider, None);
        scheduler.start();
        scheduler.set_worker_count(3).unwrap();

        scheduler.apply_policy(policy(1, 16));
        let config = scheduler.config();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(scheduler.statistics().workers, 3);

        scheduler.apply_policy(policy(2, 16));
        assert_eq!(scheduler.config().worker_count, 2);
        scheduler.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_cancels_queue_and_stragglers() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(1, 8), provider, Some(Duration::from_secs(5)));
        let running = scheduler
            .submit(SessionTarget::new("t"), nav_flow("slow", 1), TaskPriority::Normal)
            .unwrap();
        while scheduler.status(&running).unwrap().status != TaskStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = scheduler
            .submit(SessionTarget::new("t"), nav_flow("queued", 1), TaskPriority::Normal)
            .unwrap();

        let report = scheduler.shutdown(Duration::from_millis(50)).await;
        assert_eq!(
            report,
            ShutdownReport {
                cancelled_queued: 1,
                abandoned_running: 1
            }
        );
        assert_eq!(scheduler.status(&queued).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(scheduler.status(&running).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(
            scheduler.submit(SessionTarget::new("t"), nav_flow("late", 1), TaskPriority::Normal),
            Err(SchedulerError::ShuttingDown)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_paused_scheduler_keeps_tasks_pending() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let scheduler = scheduler_with(policy(2, 8), provider, None);
        scheduler.pause();
        let id = scheduler
            .submit(SessionTarget::new("t"), nav_flow("held", 1), TaskPriority::Normal)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.status(&id).unwrap().status, TaskStatus::Pending);

        scheduler.resume();
        assert_eq!(scheduler.wait(&id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_run_fails_task_and_frees_worker() {
        let provider = Arc::new(StaticEnvironmentProvider::permissive());
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let factory = FnActuatorFactory::new(move |_session: &SessionHandle| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("actuator exploded");
            }
            Arc::new(ScriptedActuator::permissive()) as Arc<dyn Actuator>
        });
        let scheduler = TaskScheduler::new(policy(1, 8), provider.clone(), Arc::new(factory));

        let first = scheduler
            .submit(SessionTarget::new("t"), nav_flow("boom", 1), TaskPriority::Normal)
            .unwrap();
        let second = scheduler
            .submit(SessionTarget::new("t"), nav_flow("after", 1), TaskPriority::Normal)
            .unwrap();

        let failed = scheduler.wait(&first).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error.unwrap().contains("actuator exploded"));
        assert_eq!(scheduler.wait(&second).await.unwrap().status, TaskStatus::Completed);

        while scheduler.statistics().running != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(scheduler.statistics().failed, 1);
        assert_eq!(provider.open_sessions(), 0);
    }
}
