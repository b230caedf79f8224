//! Store failure semantics: a launch whose durable write never
//! acknowledges fails with a timeout, rolls the Reference model back to a
//! kill-marked task, and surfaces a ChangeFailed event.

use std::sync::Arc;
use std::time::Duration;

use flotilla_reconcile::{
    job_root, EntityHolder, EventKind, JobEntity, LaunchTaskAction, ReconcileError,
    ReconciliationEngine, SubmitTaskAction, TagValue, STORE_TIMEOUT_KILL_REASON,
};
use flotilla_store::{JobRecord, JobStore, StoreFuture};
use flotilla_types::{ResourceSet, Task, TaskId, TaskState, Tier};

/// A store whose writes never acknowledge.
struct HangingStore;

impl JobStore for HangingStore {
    fn store_task(&self, _task: &Task) -> StoreFuture<()> {
        Box::pin(std::future::pending())
    }
    fn replace_task(&self, _old_id: &TaskId, _task: &Task) -> StoreFuture<()> {
        Box::pin(std::future::pending())
    }
    fn remove_task(&self, _task_id: &TaskId) -> StoreFuture<()> {
        Box::pin(std::future::pending())
    }
    fn update_job(&self, _job: &JobRecord) -> StoreFuture<()> {
        Box::pin(std::future::pending())
    }
}

fn queued_task(id: &str) -> Task {
    Task::new(
        id,
        "job-1",
        ResourceSet::from_cpu_memory(2.0, 1024),
        Tier::Flex,
        "default",
    )
    .with_state(TaskState::Queued)
}

fn engine_with_queued_task(task_id: &str) -> ReconciliationEngine<JobEntity> {
    let bootstrap = job_root("job-1").with_child(EntityHolder::new(
        task_id,
        JobEntity::Task(queued_task(task_id)),
    ));
    ReconciliationEngine::new(bootstrap)
}

/// Drive triggers until the engine goes quiet.
async fn drive(engine: &mut ReconciliationEngine<JobEntity>) {
    let mut now_ms = 1_000;
    for _ in 0..200 {
        let status = engine.trigger_events(now_ms).unwrap();
        if !status.running_change_actions {
            return;
        }
        now_ms += 10;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("engine never settled");
}

#[tokio::test]
async fn store_timeout_fails_launch_and_marks_kill() {
    let mut engine = engine_with_queued_task("t1");
    let handle = engine.handle();

    let result = handle.change_reference_model(Arc::new(LaunchTaskAction {
        task_id: "t1".into(),
        agent_host: "a1.example".into(),
        store: Arc::new(HangingStore),
        store_timeout_ms: 50,
    }));

    drive(&mut engine).await;
    assert_eq!(
        result.await.unwrap(),
        Err(ReconcileError::StoreTimeout { elapsed_ms: 50 })
    );

    // The compensating update rolled Reference to a kill-marked task.
    let task = engine
        .reference_view()
        .child("t1")
        .unwrap()
        .entity()
        .as_task()
        .unwrap()
        .clone();
    assert_eq!(task.state, TaskState::KillInitiated);
    assert_eq!(
        task.context.get("kill-reason").map(String::as_str),
        Some(STORE_TIMEOUT_KILL_REASON)
    );
    assert_eq!(
        engine.reference_view().tag("kill:t1"),
        Some(&TagValue::Text(STORE_TIMEOUT_KILL_REASON.into()))
    );

    // The launch never reached Running or Store: both still hold the
    // bootstrapped Queued task.
    for view in [engine.running_view(), engine.store_view()] {
        assert_eq!(
            view.child("t1").unwrap().entity().as_task().unwrap().state,
            TaskState::Queued
        );
    }

    // The failure is on the event stream with the timeout error.
    let events = engine.drain_events();
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::ChangeFailed)
        .expect("no ChangeFailed event");
    assert!(failed.error.as_deref().unwrap().contains("store update timed out"));
}

#[tokio::test]
async fn submit_rollback_leaves_reference_untouched() {
    let mut engine = ReconciliationEngine::new(job_root("job-1"));
    let handle = engine.handle();

    let result = handle.change_reference_model(Arc::new(SubmitTaskAction {
        task: queued_task("t1"),
        store: Arc::new(HangingStore),
        store_timeout_ms: 50,
    }));

    drive(&mut engine).await;
    assert!(matches!(
        result.await.unwrap(),
        Err(ReconcileError::StoreTimeout { .. })
    ));
    assert!(!engine.reference_view().has_child("t1"));
    assert!(!engine.store_view().has_child("t1"));
}
