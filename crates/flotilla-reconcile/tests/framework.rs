//! Framework loop integration tests: engine admission and removal, index
//! maintenance, merged event fan-out, and shutdown semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flotilla_reconcile::{
    job_root, Comparator, EngineFactory, EntityHolder, EventKind, JobEntity, ReconcileError,
    ReconciliationEngine, ReconciliationFramework, SubmitTaskAction,
};
use flotilla_store::{JobStore, RedbJobStore};
use flotilla_types::{ReconcilerConfig, ResourceSet, Task, Tier};

fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        active_timeout_ms: 10,
        idle_timeout_ms: 20,
        store_update_timeout_ms: 1_000,
    }
}

fn factory() -> EngineFactory<JobEntity> {
    Box::new(ReconciliationEngine::new)
}

fn framework() -> ReconciliationFramework<JobEntity> {
    let by_root_id: Comparator<JobEntity> =
        Arc::new(|a: &EntityHolder<JobEntity>, b: &EntityHolder<JobEntity>| a.id().cmp(b.id()));
    let comparators = HashMap::from([("by-root-id".to_string(), by_root_id)]);
    ReconciliationFramework::new(fast_config(), factory(), comparators).unwrap()
}

fn test_task(id: &str) -> Task {
    Task::new(
        id,
        "job-1",
        ResourceSet::from_cpu_memory(1.0, 512),
        Tier::Flex,
        "default",
    )
}

fn test_store() -> Arc<dyn JobStore> {
    Arc::new(RedbJobStore::open_in_memory().unwrap())
}

#[tokio::test]
async fn engine_add_and_remove_round_trip() {
    let framework = framework();
    framework.start().unwrap();

    let engine = framework.new_engine(job_root("job-1")).await.unwrap();
    assert_eq!(engine.root_id(), "job-1");
    assert!(framework.find_engine_by_root_id("job-1").is_some());
    assert_eq!(framework.ordered_view("by-root-id").len(), 1);

    framework.remove_engine("job-1").await.unwrap();
    assert!(framework.find_engine_by_root_id("job-1").is_none());
    assert!(framework.ordered_view("by-root-id").is_empty());

    assert!(framework.stop(1_000).await);
}

#[tokio::test]
async fn removing_unknown_engine_fails() {
    let framework = framework();
    framework.start().unwrap();

    let err = framework.remove_engine("ghost").await.unwrap_err();
    assert_eq!(err, ReconcileError::EngineNotFound("ghost".into()));

    framework.stop(1_000).await;
}

#[tokio::test]
async fn ordered_view_sorts_roots() {
    let framework = framework();
    framework.start().unwrap();

    framework.new_engine(job_root("job-b")).await.unwrap();
    framework.new_engine(job_root("job-a")).await.unwrap();

    let view = framework.ordered_view("by-root-id");
    let ids: Vec<&str> = view.iter().map(|h| h.id()).collect();
    assert_eq!(ids, ["job-a", "job-b"]);

    framework.stop(1_000).await;
}

#[tokio::test]
async fn merged_events_carry_engine_root_ids() {
    let framework = framework();
    framework.start().unwrap();
    let mut events = framework.events();

    let engine = framework.new_engine(job_root("job-1")).await.unwrap();
    let result = engine.change_reference_model(Arc::new(SubmitTaskAction {
        task: test_task("t1"),
        store: test_store(),
        store_timeout_ms: 1_000,
    }));
    result.await.unwrap().unwrap();

    // Collect until the completion event shows up.
    let mut kinds = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed early");
        assert_eq!(event.root_id, "job-1");
        kinds.push(event.kind);
        if event.kind == EventKind::ChangeCompleted {
            break;
        }
    }
    assert!(kinds.contains(&EventKind::ChangeStarted));
    assert!(kinds.contains(&EventKind::ModelUpdate));

    framework.stop(1_000).await;
}

#[tokio::test]
async fn late_subscriber_sees_no_replay() {
    let framework = framework();
    framework.start().unwrap();

    let engine = framework.new_engine(job_root("job-1")).await.unwrap();
    engine
        .change_reference_model(Arc::new(SubmitTaskAction {
            task: test_task("t1"),
            store: test_store(),
            store_timeout_ms: 1_000,
        }))
        .await
        .unwrap()
        .unwrap();

    // Let the completed action's events flow before subscribing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut late = framework.events();

    framework.stop(1_000).await;
    // The stream closes without replaying the earlier events.
    while let Some(event) = late.recv().await {
        assert_ne!(event.kind, EventKind::ChangeStarted, "saw replayed {event:?}");
    }
}

#[tokio::test]
async fn indexes_track_model_updates() {
    let framework = framework();
    framework.start().unwrap();

    let engine = framework.new_engine(job_root("job-1")).await.unwrap();
    engine
        .change_reference_model(Arc::new(SubmitTaskAction {
            task: test_task("t1"),
            store: test_store(),
            store_timeout_ms: 1_000,
        }))
        .await
        .unwrap()
        .unwrap();

    // The loop rebuilds indexes after model updates; poll briefly.
    let mut found = None;
    for _ in 0..50 {
        found = framework.find_engine_by_child_id("t1");
        if found.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (owner, child) = found.expect("child index never updated");
    assert_eq!(owner.root_id(), "job-1");
    assert_eq!(child.id(), "t1");

    framework.stop(1_000).await;
}

#[tokio::test]
async fn unpolled_subscriber_does_not_starve_the_loop() {
    let framework = framework();
    framework.start().unwrap();

    // Subscribe and never poll: sends are unbounded and must not block
    // engine admission or removal.
    let _ignored = framework.events();

    for i in 0..5 {
        let root = format!("job-{i}");
        framework.new_engine(job_root(root.clone())).await.unwrap();
        framework.remove_engine(&root).await.unwrap();
    }

    assert!(framework.stop(1_000).await);
}

#[tokio::test]
async fn stopped_framework_rejects_new_work() {
    let framework = framework();
    framework.start().unwrap();
    assert!(framework.stop(1_000).await);

    let err = framework.new_engine(job_root("job-1")).await.unwrap_err();
    assert_eq!(err, ReconcileError::ShutdownInProgress);
    let err = framework.remove_engine("job-1").await.unwrap_err();
    assert_eq!(err, ReconcileError::ShutdownInProgress);
}

#[tokio::test]
async fn stop_completes_subscriber_streams() {
    let framework = framework();
    framework.start().unwrap();
    let mut events = framework.events();

    framework.new_engine(job_root("job-1")).await.unwrap();
    framework.stop(1_000).await;

    // Stream ends (None) once the framework is gone.
    loop {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(None) => break,
            Ok(Some(_)) => continue,
            Err(_) => panic!("event stream never closed"),
        }
    }
}
