//! End-to-end placement scenarios: single placement, contention,
//! capacity-group fair share, agent disablement, and autoscale-up.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flotilla_autoscale::{
    AutoscaleController, ClusterManager, InstanceGroupEvent, ScaleDownOutcome,
};
use flotilla_constraints::{
    BinPackingFitness, CompositeEvaluator, ConstraintRegistry, Decision, EvaluationContext,
    HardConstraint,
};
use flotilla_metrics::RecordingRegistry;
use flotilla_offers::OfferPool;
use flotilla_queue::TieredTaskQueue;
use flotilla_reconcile::{
    job_root, EntityHolder, EventKind, JobEntity, LaunchTaskAction, ReconciliationEngine,
};
use flotilla_scheduler::{
    AgentHealth, AgentStatus, LaunchHandler, OfferRescind, PlacementEngine, SchedulerError,
    TaskMigrator, TaskPlacement,
};
use flotilla_store::RedbJobStore;
use flotilla_types::{
    AgentId, AgentState, CapacityGroupSla, InstanceGroup, Offer, ResourceSet, SchedulerConfig,
    Task, TaskId, TaskState, Tier, TierSlas,
};

struct AdmitAll;
impl HardConstraint for AdmitAll {
    fn name(&self) -> &str {
        "admit-all"
    }
    fn evaluate(
        &self,
        _: &Task,
        _: &AgentState,
        _: &EvaluationContext,
    ) -> anyhow::Result<Decision> {
        Ok(Decision::admit())
    }
}

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<(TaskId, AgentId)>>,
    reject: Mutex<HashSet<TaskId>>,
}

impl RecordingLauncher {
    fn launched_ids(&self) -> Vec<(TaskId, AgentId)> {
        self.launched.lock().unwrap().clone()
    }

    fn reject_next(&self, task_id: &str) {
        self.reject.lock().unwrap().insert(task_id.to_string());
    }
}

impl LaunchHandler for RecordingLauncher {
    fn launch_tasks(&self, placements: &[TaskPlacement]) -> anyhow::Result<Vec<TaskId>> {
        let mut reject = self.reject.lock().unwrap();
        let mut rejected = Vec::new();
        for placement in placements {
            if reject.remove(&placement.task.id) {
                rejected.push(placement.task.id.clone());
            } else {
                self.launched
                    .lock()
                    .unwrap()
                    .push((placement.task.id.clone(), placement.agent_id.clone()));
            }
        }
        Ok(rejected)
    }
}

#[derive(Default)]
struct RecordingCluster {
    ups: Mutex<Vec<(String, u32)>>,
}

impl ClusterManager for RecordingCluster {
    fn scale_up(&self, group_id: &str, count: u32) -> anyhow::Result<()> {
        self.ups.lock().unwrap().push((group_id.to_string(), count));
        Ok(())
    }

    fn scale_down(
        &self,
        _group_id: &str,
        instance_ids: Vec<AgentId>,
    ) -> anyhow::Result<ScaleDownOutcome> {
        Ok(ScaleDownOutcome {
            terminated: instance_ids,
            not_terminated: Vec::new(),
        })
    }
}

struct NoopMigrator;
impl TaskMigrator for NoopMigrator {
    fn migrate(&self, _tasks: Vec<TaskId>) {}
}

struct Harness {
    engine: PlacementEngine,
    queue: Arc<TieredTaskQueue>,
    offers: Arc<OfferPool>,
    launcher: Arc<RecordingLauncher>,
    cluster: Arc<RecordingCluster>,
    registry: Arc<RecordingRegistry>,
}

fn harness_with(config: SchedulerConfig) -> Harness {
    let queue = Arc::new(TieredTaskQueue::new());
    let offers = Arc::new(OfferPool::new(Arc::new(|_offer, _reason| {})));
    let launcher = Arc::new(RecordingLauncher::default());
    let cluster = Arc::new(RecordingCluster::default());
    let registry = Arc::new(RecordingRegistry::new());

    let evaluator = CompositeEvaluator::new(
        ConstraintRegistry::new(),
        Arc::new(AdmitAll),
        Arc::new(BinPackingFitness),
        config.fitness_good_enough,
    );
    let autoscaler = AutoscaleController::new(
        config.delay_autoscale_up_by_secs,
        config.delay_autoscale_down_by_secs,
    );

    let engine = PlacementEngine::new(
        config,
        queue.clone(),
        offers.clone(),
        evaluator,
        autoscaler,
        launcher.clone(),
        cluster.clone(),
        Arc::new(NoopMigrator),
        registry.as_ref(),
    )
    .unwrap();

    Harness {
        engine,
        queue,
        offers,
        launcher,
        cluster,
        registry,
    }
}

fn harness() -> Harness {
    harness_with(SchedulerConfig::default())
}

fn task(id: &str, cpus: f64, memory_mb: u64) -> Task {
    Task::new(
        id,
        "job-1",
        ResourceSet::from_cpu_memory(cpus, memory_mb),
        Tier::Flex,
        "default",
    )
    .with_state(TaskState::Queued)
}

fn offer(id: &str, agent: &str, cpus: f64, memory_mb: u64) -> Offer {
    Offer {
        id: id.into(),
        agent_id: agent.into(),
        hostname: format!("{agent}.example"),
        resources: ResourceSet::from_cpu_memory(cpus, memory_mb),
        attributes: BTreeMap::new(),
        offered_at_ms: 0,
        expires_at_ms: 100_000_000,
    }
}

// ── Scenario 1: simple placement ────────────────────────────────────

#[tokio::test]
async fn simple_placement_launches_and_reconciles() {
    let h = harness();
    h.queue.enqueue(task("t1", 2.0, 1024)).unwrap();
    h.engine.handle_offers(vec![offer("o1", "a1", 4.0, 4096)]);

    let outcome = h.engine.run_iteration(1_000);
    assert_eq!(outcome.launched, 1);
    assert_eq!(h.launcher.launched_ids(), vec![("t1".to_string(), "a1".to_string())]);
    // The task left the queue and the offer was consumed.
    assert!(h.queue.is_empty());
    assert!(h.offers.snapshot(1_000)[0].offer_ids.is_empty());
    assert_eq!(h.registry.counter_value("scheduler.workersLaunched"), 1);

    // Record the placement through a reconciliation engine: one
    // ChangeCompleted event, task Launched on a1.
    let store = Arc::new(RedbJobStore::open_in_memory().unwrap());
    let bootstrap = job_root("job-1").with_child(EntityHolder::new(
        "t1",
        JobEntity::Task(task("t1", 2.0, 1024)),
    ));
    let mut reconcile = ReconciliationEngine::new(bootstrap);
    let handle = reconcile.handle();
    let result = handle.change_reference_model(Arc::new(LaunchTaskAction {
        task_id: "t1".into(),
        agent_host: "a1.example".into(),
        store: store.clone(),
        store_timeout_ms: 5_000,
    }));

    let mut now_ms = 2_000;
    for _ in 0..100 {
        if !reconcile
            .trigger_events(now_ms)
            .unwrap()
            .running_change_actions
        {
            break;
        }
        now_ms += 10;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    result.await.unwrap().unwrap();

    let launched = reconcile
        .reference_view()
        .child("t1")
        .unwrap()
        .entity()
        .as_task()
        .unwrap()
        .clone();
    assert_eq!(launched.state, TaskState::Launched);
    assert_eq!(
        launched.context.get("agent.host").map(String::as_str),
        Some("a1.example")
    );
    let completed = reconcile
        .drain_events()
        .into_iter()
        .filter(|e| e.kind == EventKind::ChangeCompleted)
        .count();
    assert_eq!(completed, 1);
    assert_eq!(store.get_task("t1").unwrap().unwrap().state, TaskState::Launched);
}

// ── Scenario 2: contention ──────────────────────────────────────────

#[tokio::test]
async fn contention_launches_one_and_reports_cpu_insufficiency() {
    let h = harness();
    h.queue.enqueue(task("t1", 3.0, 1024)).unwrap();
    h.queue.enqueue(task("t2", 3.0, 1024)).unwrap();
    h.engine.handle_offers(vec![offer("o1", "a1", 4.0, 4096)]);

    let failure_rx = h.engine.register_task_failure_action("t2").unwrap();

    let outcome = h.engine.run_iteration(1_000);
    assert_eq!(outcome.launched, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(h.launcher.launched_ids()[0].0, "t1");
    // The loser stays queued with the violation recorded against it.
    assert_eq!(h.queue.len(Tier::Flex), 1);

    let failure = failure_rx.await.unwrap().expect("no failure delivered");
    assert_eq!(failure.task_id, "t2");
    assert_eq!(failure.reason, "insufficient cpu");
}

// ── Scenario 4: capacity-group fair share ───────────────────────────

#[tokio::test]
async fn capacity_groups_split_the_offer_at_their_guarantee() {
    let h = harness();
    let sla = |name: &str| {
        CapacityGroupSla::new(
            name,
            Tier::Flex,
            ResourceSet::from_cpu_memory(4.0, 0),
            ResourceSet::from_cpu_memory(4.0, 0),
            0.0,
        )
        .unwrap()
    };
    h.queue
        .set_sla(TierSlas::new().with_group(sla("a")).with_group(sla("b")));

    for i in 0..10 {
        for group in ["a", "b"] {
            let t = Task::new(
                format!("{group}{i}"),
                "job-1",
                ResourceSet::from_cpu_memory(1.0, 512),
                Tier::Flex,
                group,
            )
            .with_state(TaskState::Queued);
            h.queue.enqueue(t).unwrap();
        }
    }
    h.engine.handle_offers(vec![offer("o1", "a1", 8.0, 65_536)]);

    let outcome = h.engine.run_iteration(1_000);
    assert_eq!(outcome.launched, 8);

    let launched = h.launcher.launched_ids();
    let a_count = launched.iter().filter(|(id, _)| id.starts_with('a')).count();
    let b_count = launched.iter().filter(|(id, _)| id.starts_with('b')).count();
    assert_eq!((a_count, b_count), (4, 4));

    // The untouched tasks stay queued in FIFO order: a0..a3 launched,
    // a4..a9 remain.
    for i in 0..4 {
        assert!(launched.iter().any(|(id, _)| id == &format!("a{i}")));
    }
    assert_eq!(h.queue.len(Tier::Flex), 12);
}

// ── Scenario 5: agent disable ───────────────────────────────────────

#[tokio::test]
async fn unhealthy_agent_is_skipped_until_healthy_again() {
    let h = harness();
    h.queue.enqueue(task("t1", 1.0, 512)).unwrap();
    h.engine.handle_offers(vec![offer("o1", "a1", 4.0, 4096)]);

    h.engine.apply_agent_status(
        AgentStatus {
            agent_id: "a1".into(),
            health: AgentHealth::Unhealthy,
            disable_ms: Some(60_000),
        },
        1_000,
    );

    let outcome = h.engine.run_iteration(2_000);
    assert_eq!(outcome.launched, 0);
    assert_eq!(outcome.failed, 1);

    h.engine.apply_agent_status(
        AgentStatus {
            agent_id: "a1".into(),
            health: AgentHealth::Healthy,
            disable_ms: None,
        },
        3_000,
    );
    let outcome = h.engine.run_iteration(3_000);
    assert_eq!(outcome.launched, 1);
}

#[tokio::test]
async fn disable_window_expires_on_its_own() {
    let h = harness();
    h.queue.enqueue(task("t1", 1.0, 512)).unwrap();
    h.engine.handle_offers(vec![offer("o1", "a1", 4.0, 4096)]);

    h.engine.apply_agent_status(
        AgentStatus {
            agent_id: "a1".into(),
            health: AgentHealth::Unhealthy,
            disable_ms: Some(60_000),
        },
        1_000,
    );

    assert_eq!(h.engine.run_iteration(2_000).launched, 0);
    // 60 seconds later the window has passed.
    assert_eq!(h.engine.run_iteration(62_000).launched, 1);
}

// ── Scenario 6: autoscale up ────────────────────────────────────────

#[tokio::test]
async fn unmet_demand_produces_a_scale_up() {
    let config = SchedulerConfig {
        delay_autoscale_up_by_secs: 0,
        ..SchedulerConfig::default()
    };
    let h = harness_with(config);

    let group = InstanceGroup::new("g", 0, 20, 0, 2, 0, 0, 1).unwrap();
    h.engine.apply_group_event(InstanceGroupEvent::Updated(group));
    h.engine.set_tier_group(Tier::Flex, "g");
    h.engine
        .set_group_slot("g", ResourceSet::from_cpu_memory(4.0, 4096));

    for i in 0..10 {
        h.queue.enqueue(task(&format!("t{i}"), 4.0, 1024)).unwrap();
    }

    let outcome = h.engine.run_iteration(1_000);
    assert_eq!(outcome.launched, 0);
    assert_eq!(outcome.failed, 10);
    assert_eq!(outcome.scale_actions, 1);
    assert_eq!(
        h.cluster.ups.lock().unwrap().clone(),
        vec![("g".to_string(), 10)]
    );
    assert_eq!(h.registry.counter_value("scheduler.autoScaleUpActions"), 1);
}

// ── Callback queue bounds and null drain ────────────────────────────

#[tokio::test]
async fn failure_callback_capacity_is_bounded() {
    let h = harness();
    let mut receivers = Vec::new();
    for i in 0..5 {
        receivers.push(h.engine.register_task_failure_action(&format!("t{i}")).unwrap());
    }
    let err = h.engine.register_task_failure_action("t5").unwrap_err();
    assert!(matches!(err, SchedulerError::CapacityExceeded));
    assert_eq!(
        h.registry
            .counter_value("scheduler.taskFailureRequestsLimitReached"),
        1
    );
}

#[tokio::test]
async fn callbacks_drain_with_null_result_when_no_failure() {
    let h = harness();
    h.queue.enqueue(task("t1", 1.0, 512)).unwrap();
    h.engine.handle_offers(vec![offer("o1", "a1", 4.0, 4096)]);
    let rx = h.engine.register_task_failure_action("t1").unwrap();

    let outcome = h.engine.run_iteration(1_000);
    assert_eq!(outcome.launched, 1);
    assert_eq!(rx.await.unwrap(), None);
}

// ── Launch rejection frees the work for the next iteration ──────────

#[tokio::test]
async fn rejected_assignment_keeps_task_queued_and_offer_alive() {
    let h = harness();
    h.queue.enqueue(task("t1", 1.0, 512)).unwrap();
    h.engine.handle_offers(vec![offer("o1", "a1", 4.0, 4096)]);
    h.launcher.reject_next("t1");

    let outcome = h.engine.run_iteration(1_000);
    assert_eq!(outcome.launched, 0);
    assert_eq!(h.queue.len(Tier::Flex), 1);
    // The offer was not consumed; the next iteration succeeds.
    let outcome = h.engine.run_iteration(2_000);
    assert_eq!(outcome.launched, 1);
}

// ── Offer consumption modes ─────────────────────────────────────────

#[tokio::test]
async fn keep_together_consumes_the_whole_offer_set() {
    let h = harness();
    h.queue.enqueue(task("t1", 1.0, 512)).unwrap();
    h.engine.handle_offers(vec![
        offer("o1", "a1", 2.0, 2048),
        offer("o2", "a1", 2.0, 2048),
    ]);

    assert_eq!(h.engine.run_iteration(1_000).launched, 1);
    assert!(h.offers.snapshot(1_000)[0].offer_ids.is_empty());
}

#[tokio::test]
async fn multi_task_per_offer_keeps_uncovered_offers_live() {
    let config = SchedulerConfig {
        multi_task_per_offer: true,
        ..SchedulerConfig::default()
    };
    let h = harness_with(config);
    h.queue.enqueue(task("t1", 1.0, 512)).unwrap();
    h.engine.handle_offers(vec![
        offer("o1", "a1", 2.0, 2048),
        offer("o2", "a1", 2.0, 2048),
    ]);

    assert_eq!(h.engine.run_iteration(1_000).launched, 1);
    // Only the oldest offer was needed; the other stays live.
    assert_eq!(h.offers.snapshot(1_000)[0].offer_ids, vec!["o2".to_string()]);
}

// ── Rescind handling ────────────────────────────────────────────────

#[tokio::test]
async fn rescind_all_empties_the_pool() {
    let h = harness();
    h.engine.handle_offers(vec![
        offer("o1", "a1", 2.0, 2048),
        offer("o2", "a2", 2.0, 2048),
    ]);

    h.engine.apply_rescind(OfferRescind::All);
    assert!(h
        .offers
        .snapshot(1_000)
        .iter()
        .all(|s| s.offer_ids.is_empty()));
    assert_eq!(h.registry.counter_value("scheduler.offersRejected"), 2);
}
