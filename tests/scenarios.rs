use std::sync::Arc;
use std::time::Duration;

use action_flow::{Condition, ConditionOperator, Flow, LoopConfig, Step};
use action_primitives::{ScriptedActuator, ScriptedElement};
use browserflow_cli::{Engine, EngineError};
use browserflow_policy_center::{default_snapshot, PolicySnapshot};
use browserflow_scheduler::{
    SchedulerError, SharedActuator, StaticEnvironmentProvider, TaskPriority, TaskStatus,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

fn policy(workers: usize, capacity: usize) -> PolicySnapshot {
    let mut snapshot = default_snapshot();
    snapshot.scheduler.worker_count = workers;
    snapshot.scheduler.queue_capacity = capacity;
    snapshot
}

fn engine_with(
    snapshot: PolicySnapshot,
    actuator: Arc<ScriptedActuator>,
) -> (Engine, Arc<StaticEnvironmentProvider>) {
    let provider = Arc::new(StaticEnvironmentProvider::permissive());
    let engine = Engine::new(
        snapshot,
        provider.clone(),
        Arc::new(SharedActuator::new(actuator)),
    );
    (engine, provider)
}

fn three_step_flow() -> Flow {
    Flow::new("checkout")
        .with_step(Step::new("open", "navigate").with_param("url", "https://shop.test"))
        .with_step(Step::new("buy", "click").with_param("selector", "#buy"))
        .with_step(
            Step::new("read", "extract_text")
                .with_param("selector", "h1")
                .with_param("output_variable", "heading"),
        )
}

async fn wait_for_status(engine: &Engine, id: &browserflow_core_types::TaskId, status: TaskStatus) {
    for _ in 0..200 {
        if engine.task_status(id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task never reached {status}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_walks_pending_running_completed() {
    let actuator = Arc::new(ScriptedActuator::new());
    actuator.add_element("#buy", ScriptedElement::default());
    actuator.add_element("h1", ScriptedElement::with_text("Thanks"));
    actuator.set_latency(Duration::from_millis(60));
    let (engine, _) = engine_with(policy(1, 16), actuator);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine
        .scheduler()
        .on_complete(move |snapshot| sink.lock().push(snapshot.status));

    engine.start();
    engine.pause_all();
    let id = engine
        .submit_task("profile-a", three_step_flow(), TaskPriority::Normal)
        .unwrap();
    assert_eq!(engine.task_status(&id).unwrap().status, TaskStatus::Pending);

    engine.resume_all();
    wait_for_status(&engine, &id, TaskStatus::Running).await;

    let snapshot = engine.wait_for_task(&id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.progress, 100);
    let result = snapshot.result.unwrap();
    assert_eq!(result.completed_step_count, 3);
    assert_eq!(result.variables.get("heading"), Some(&json!("Thanks")));
    assert_eq!(*seen.lock(), vec![TaskStatus::Completed]);

    engine.shutdown_within(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_element_is_clicked_on_second_attempt() {
    let actuator = Arc::new(ScriptedActuator::new());
    actuator.add_element("#late", ScriptedElement::default());
    actuator.appear_after("#late", 1);
    let (engine, _) = engine_with(policy(1, 16), actuator);
    engine.start();

    let flow = Flow::new("late").with_step(Step::new("press", "click").with_param("selector", "#late"));
    let id = engine.submit_task("profile-a", flow, TaskPriority::High).unwrap();
    let snapshot = engine.wait_for_task(&id).await.unwrap();

    assert_eq!(snapshot.status, TaskStatus::Completed);
    let result = snapshot.result.unwrap();
    let press: Vec<_> = result.results_for("press").collect();
    assert_eq!(press.len(), 1);
    assert_eq!(press[0].attempts, 2);

    engine.shutdown_within(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_endless_while_loop_stops_at_guard() {
    let (engine, _) = engine_with(policy(1, 16), Arc::new(ScriptedActuator::new()));
    engine.start();

    let flow = Flow::new("spin")
        .with_variable("forever", true)
        .with_step(Step::new("loop", "while").with_loop(LoopConfig::while_true(
            Condition::new("forever", ConditionOperator::Exists, Value::Null),
            5,
        )))
        .with_step(Step::new("tick", "increment_variable").with_param("name", "ticks"))
        .with_step(Step::new("end", "end_loop"));

    let id = engine.submit_task("profile-a", flow, TaskPriority::Normal).unwrap();
    let snapshot = engine.wait_for_task(&id).await.unwrap();

    assert_eq!(snapshot.status, TaskStatus::Completed);
    let result = snapshot.result.unwrap();
    assert!(result.success);
    assert_eq!(result.results_for("tick").count(), 5);
    assert_eq!(result.variables.get("ticks"), Some(&json!(5)));

    engine.shutdown_within(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_queued_task_is_never_dispatched() {
    let actuator = Arc::new(ScriptedActuator::permissive());
    let (engine, provider) = engine_with(policy(1, 16), actuator.clone());
    engine.start();
    engine.pause_all();

    let id = engine
        .submit_task("profile-a", three_step_flow(), TaskPriority::Normal)
        .unwrap();
    assert_eq!(engine.cancel_task(&id).unwrap(), TaskStatus::Cancelled);
    engine.resume_all();

    let snapshot = engine.wait_for_task(&id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    assert!(snapshot.started_at.is_none());
    assert_eq!(provider.peak_open_sessions(), 0);
    assert!(actuator.calls().is_empty());

    engine.shutdown_within(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_respects_worker_bound_and_capacity() {
    let actuator = Arc::new(ScriptedActuator::permissive());
    actuator.set_latency(Duration::from_millis(20));
    let (engine, provider) = engine_with(policy(2, 5), actuator);
    engine.start();
    engine.pause_all();

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for n in 0..8 {
        let flow = Flow::new(format!("burst-{n}"))
            .with_step(Step::new("open", "navigate").with_param("url", "https://burst.test"));
        match engine.submit_task("profile-a", flow, TaskPriority::Normal) {
            Ok(id) => accepted.push(id),
            Err(EngineError::Scheduler(SchedulerError::QueueFull { capacity })) => {
                assert_eq!(capacity, 5);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted.len(), 5);
    assert_eq!(rejected, 3);

    engine.resume_all();
    for id in &accepted {
        assert_eq!(engine.wait_for_task(id).await.unwrap().status, TaskStatus::Completed);
    }
    assert!(provider.peak_open_sessions() <= 2);
    let stats = engine.scheduler_statistics();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.completed, 5);

    engine.shutdown_within(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_step_surfaces_in_task_error() {
    let (engine, _) = engine_with(policy(1, 16), Arc::new(ScriptedActuator::new()));
    engine.start();

    let flow = Flow::new("broken").with_step(Step::new("bogus", "teleport"));
    let id = engine.submit_task("profile-a", flow, TaskPriority::Low).unwrap();
    let snapshot = engine.wait_for_task(&id).await.unwrap();

    assert_eq!(snapshot.status, TaskStatus::Failed);
    let result = snapshot.result.unwrap();
    assert!(!result.success);
    assert_eq!(result.completed_step_count, 0);
    assert!(result
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("unsupported operation"));
    assert_eq!(engine.scheduler_statistics().failed, 1);

    engine.shutdown_within(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_metadata_is_visible_to_flow() {
    let provider = Arc::new(StaticEnvironmentProvider::new());
    let mut metadata = serde_json::Map::new();
    metadata.insert("region".into(), Value::from("eu"));
    provider.register(browserflow_core_types::SessionTarget::new("profile-eu"), metadata);

    let engine = Engine::new(
        policy(1, 16),
        provider,
        Arc::new(SharedActuator::new(Arc::new(ScriptedActuator::new()))),
    );
    engine.start();

    let flow = Flow::new("copy-region").with_step(
        Step::new("copy", "set_variable")
            .with_param("name", "where")
            .with_param("value", "${region}"),
    );
    let id = engine.submit_task("profile-eu", flow, TaskPriority::Normal).unwrap();
    let snapshot = engine.wait_for_task(&id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(
        snapshot.result.unwrap().variables.get("where"),
        Some(&json!("eu"))
    );

    let unknown = engine
        .submit_task("profile-us", Flow::new("noop"), TaskPriority::Normal)
        .unwrap();
    let snapshot = engine.wait_for_task(&unknown).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert!(snapshot
        .error
        .unwrap()
        .contains("session acquisition failed"));

    engine.shutdown_within(Duration::from_secs(1)).await;
}
