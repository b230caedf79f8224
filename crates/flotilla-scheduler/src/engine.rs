//! The placement engine and its iteration loop.

use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use flotilla_autoscale::{
    AutoscaleController, ClusterManager, GroupView, IdleAgent, InstanceGroupEvent,
    OptimizingShortfallEvaluator, ScaleAction,
};
use flotilla_constraints::{CompositeEvaluator, EvaluationContext};
use flotilla_metrics::MetricsRegistry;
use flotilla_offers::{AgentSnapshot, OfferPool, RejectReason};
use flotilla_queue::{GroupConsumption, TieredTaskQueue};
use flotilla_types::{
    AgentId, AgentState, FleetUsage, Offer, OfferId, ResourceSet, SchedulerConfig, TaskId, Tier,
};

use crate::collaborators::{AgentHealth, AgentStatus, LaunchHandler, OfferRescind, TaskMigrator};
use crate::error::{SchedulerError, SchedulerResult};
use crate::metrics::SchedulerMetrics;
use crate::plan::{plan_iteration, PlacementFailure, TaskPlacement};

/// Summary of one iteration, for callers and tests.
#[derive(Debug, Default)]
pub struct IterationOutcome {
    pub launched: usize,
    pub failed: usize,
    pub deferred: usize,
    pub evicted_offers: usize,
    pub scale_actions: usize,
}

struct LaunchedTask {
    agent_id: AgentId,
    capacity_group: String,
    resources: ResourceSet,
}

/// The periodic matching loop over queue and offer pool.
pub struct PlacementEngine {
    config: SchedulerConfig,
    queue: Arc<TieredTaskQueue>,
    offers: Arc<OfferPool>,
    evaluator: CompositeEvaluator,
    autoscaler: Mutex<AutoscaleController>,
    launcher: Arc<dyn LaunchHandler>,
    cluster: Arc<dyn ClusterManager>,
    migrator: Arc<dyn TaskMigrator>,
    metrics: SchedulerMetrics,
    /// Tasks currently launched, for capacity-group consumption and I2.
    launched: Mutex<HashMap<TaskId, LaunchedTask>>,
    /// Bounded placement-failure callback registrations.
    failure_actions: Mutex<Vec<(TaskId, oneshot::Sender<Option<PlacementFailure>>)>>,
    /// When each agent was first observed idle.
    idle_since: Mutex<HashMap<AgentId, u64>>,
    /// Typical per-instance slot per group, for shortfall sizing.
    group_slots: Mutex<HashMap<String, ResourceSet>>,
    /// Which instance group absorbs a tier's unplaced demand.
    tier_groups: Mutex<HashMap<Tier, String>>,
}

impl PlacementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        queue: Arc<TieredTaskQueue>,
        offers: Arc<OfferPool>,
        evaluator: CompositeEvaluator,
        autoscaler: AutoscaleController,
        launcher: Arc<dyn LaunchHandler>,
        cluster: Arc<dyn ClusterManager>,
        migrator: Arc<dyn TaskMigrator>,
        registry: &dyn MetricsRegistry,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let autoscaler = if config.optimizing_shortfall_evaluator_enabled {
            autoscaler.with_shortfall_evaluator(Arc::new(OptimizingShortfallEvaluator))
        } else {
            autoscaler
        };
        Ok(Self {
            metrics: SchedulerMetrics::new(registry),
            config,
            queue,
            offers,
            evaluator,
            autoscaler: Mutex::new(autoscaler),
            launcher,
            cluster,
            migrator,
            launched: Mutex::new(HashMap::new()),
            failure_actions: Mutex::new(Vec::new()),
            idle_since: Mutex::new(HashMap::new()),
            group_slots: Mutex::new(HashMap::new()),
            tier_groups: Mutex::new(HashMap::new()),
        })
    }

    // ── Inbound collaborator streams ───────────────────────────────

    /// New offers from the offer source.
    pub fn handle_offers(&self, offers: Vec<Offer>) {
        self.metrics.offers_received.add(offers.len() as u64);
        for offer in offers {
            self.offers.add_offer(offer);
        }
    }

    /// A rescind notice: one offer, one agent, or everything.
    pub fn apply_rescind(&self, rescind: OfferRescind) {
        let rejected = match rescind {
            OfferRescind::Offer(id) => self.offers.reject_offer(&id, RejectReason::Rescinded) as usize,
            OfferRescind::Agent(agent_id) => {
                self.offers.expire_all_for(&agent_id, RejectReason::Rescinded)
            }
            OfferRescind::All => self.offers.expire_all(RejectReason::Rescinded),
        };
        self.metrics.offers_rejected.add(rejected as u64);
    }

    /// A health report: enable, or disable for the requested window.
    pub fn apply_agent_status(&self, status: AgentStatus, now_ms: u64) {
        match status.health {
            AgentHealth::Healthy => self.offers.enable(&status.agent_id),
            AgentHealth::Unhealthy => {
                let disable_ms = status.disable_ms.unwrap_or(60_000);
                self.offers.disable(&status.agent_id, disable_ms, now_ms);
            }
        }
    }

    /// Instance-group add/update/remove from the cluster manager.
    pub fn apply_group_event(&self, event: InstanceGroupEvent) {
        self.autoscaler.lock().unwrap().apply_group_event(event);
    }

    /// Route a tier's unplaced demand to an instance group.
    pub fn set_tier_group(&self, tier: Tier, group_id: impl Into<String>) {
        self.tier_groups.lock().unwrap().insert(tier, group_id.into());
    }

    /// Typical slot size used to convert a group's shortfall into an
    /// instance count.
    pub fn set_group_slot(&self, group_id: impl Into<String>, slot: ResourceSet) {
        self.group_slots.lock().unwrap().insert(group_id.into(), slot);
    }

    /// Register a one-shot placement-failure callback for a task. At most
    /// `task_failures_queue_capacity` registrations may be pending.
    pub fn register_task_failure_action(
        &self,
        task_id: &str,
    ) -> SchedulerResult<oneshot::Receiver<Option<PlacementFailure>>> {
        let mut actions = self.failure_actions.lock().unwrap();
        if actions.len() >= self.config.task_failures_queue_capacity {
            self.metrics.task_failure_requests_rejected.increment();
            return Err(SchedulerError::CapacityExceeded);
        }
        self.metrics.task_failure_requests.increment();
        let (tx, rx) = oneshot::channel();
        actions.push((task_id.to_string(), tx));
        Ok(rx)
    }

    /// The job subsystem reports a task gone from the cluster.
    pub fn task_finished(&self, task_id: &str) -> bool {
        let removed = self.launched.lock().unwrap().remove(task_id);
        match removed {
            Some(task) => {
                self.offers.task_finished(&task.agent_id, task_id);
                true
            }
            None => false,
        }
    }

    // ── The loop ───────────────────────────────────────────────────

    /// Run iterations until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.scheduler_iteration_interval_ms,
            "placement engine started"
        );
        loop {
            let outcome = self.run_iteration(epoch_ms());
            // Rate-limit when nothing could be assigned; keep pace while
            // work is flowing.
            let delay_ms = if outcome.launched > 0 || outcome.deferred > 0 {
                self.config.scheduler_iteration_interval_ms
            } else {
                self.config.max_delay_ms_between_iterations
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = shutdown.changed() => {
                    info!("placement engine shutting down");
                    return;
                }
            }
        }
    }

    /// One full placement iteration.
    pub fn run_iteration(&self, now_ms: u64) -> IterationOutcome {
        let started = Instant::now();

        // 1. Pre-hook: refresh global constraints.
        self.evaluator.prepare();

        // 2. Evict stale offers, sweep inactive agents, snapshot.
        let evicted = self
            .offers
            .evict_expired(now_ms, self.config.lease_offer_expiry_secs);
        self.metrics.offers_rejected.add(evicted as u64);

        let mut snapshots = self.offers.snapshot(now_ms);
        if self.sweep_inactive_agents(&snapshots) > 0 {
            snapshots = self.offers.snapshot(now_ms);
        }

        let consumption = self.group_consumption();
        let ordered = self.queue.drain_for_iteration(&consumption);

        // 3. Match against working copies.
        let mut ctx = EvaluationContext::new(
            now_ms,
            self.config.active_agent_attribute_name.clone(),
            self.config.zone_attribute_name.clone(),
        );
        let deadline =
            Instant::now() + Duration::from_millis(self.config.max_delay_ms_between_iterations);
        let plan = plan_iteration(&ordered, &snapshots, &self.evaluator, &mut ctx, Some(deadline));

        // 4. Hand assignments to the launch collaborator.
        let rejected: HashSet<TaskId> = if plan.placements.is_empty() {
            HashSet::new()
        } else {
            match self.launcher.launch_tasks(&plan.placements) {
                Ok(rejected) => rejected.into_iter().collect(),
                Err(e) => {
                    self.handle_fatal(&format!("launch handler failed: {e}"));
                    plan.placements.iter().map(|p| p.task.id.clone()).collect()
                }
            }
        };

        let mut launched = 0usize;
        let mut accepted: Vec<&TaskPlacement> = Vec::new();
        for placement in &plan.placements {
            if rejected.contains(&placement.task.id) {
                debug!(task_id = %placement.task.id, "assignment rejected by launch handler");
                continue;
            }
            launched += 1;
            accepted.push(placement);
            self.queue.remove(&placement.task.id, placement.task.tier);
            self.offers.task_launched(
                &placement.agent_id,
                placement.task.id.clone(),
                placement.task.resources.clone(),
            );
            self.launched.lock().unwrap().insert(
                placement.task.id.clone(),
                LaunchedTask {
                    agent_id: placement.agent_id.clone(),
                    capacity_group: placement.task.capacity_group.clone(),
                    resources: placement.task.resources.clone(),
                },
            );
        }
        self.consume_offers_for(&accepted);
        self.metrics.workers_launched.add(launched as u64);

        // 5. Autoscale over the post-iteration view.
        let views = self.build_group_views(&snapshots, &plan.failures, now_ms);
        let actions = self.autoscaler.lock().unwrap().evaluate(&views, now_ms);
        for action in &actions {
            self.execute_scale_action(action);
        }

        // 6. Placement-failure callbacks; leftovers get a null result.
        self.deliver_failure_callbacks(&plan.failures);

        // 7. Metrics.
        self.publish_fleet_metrics(&snapshots, now_ms, plan.failures.len());
        self.metrics.iteration_run_ms.record(started.elapsed());

        IterationOutcome {
            launched,
            failed: plan.failures.len(),
            deferred: plan.deferred.len(),
            evicted_offers: evicted,
            scale_actions: actions.len(),
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Agents explicitly tagged inactive lose their offers, and their
    /// running tasks are handed to the migrator. Returns how many agents
    /// were swept.
    fn sweep_inactive_agents(&self, snapshots: &[AgentSnapshot]) -> usize {
        let attribute = &self.config.active_agent_attribute_name;
        let mut swept = 0;
        for snapshot in snapshots {
            let Some(value) = snapshot.agent.attributes.get(attribute) else {
                continue;
            };
            if value == "true" || snapshot.offer_ids.is_empty() {
                continue;
            }
            info!(agent = %snapshot.agent.id, "expiring offers of inactive agent");
            let tasks: Vec<TaskId> = snapshot.agent.running_tasks.iter().cloned().collect();
            if !tasks.is_empty() {
                self.migrator.migrate(tasks);
            }
            self.offers
                .expire_all_for(&snapshot.agent.id, RejectReason::AgentInactive);
            swept += 1;
        }
        swept
    }

    fn group_consumption(&self) -> GroupConsumption {
        let launched = self.launched.lock().unwrap();
        let mut consumption = GroupConsumption::new();
        for task in launched.values() {
            let entry = consumption
                .entry(task.capacity_group.clone())
                .or_default();
            *entry = entry.add(&task.resources);
        }
        consumption
    }

    /// Consume the offers backing accepted assignments. Keep-together by
    /// default: an agent's whole offer set is used as a unit. In
    /// multi-task-per-offer mode only the oldest offers covering the
    /// accepted demand are consumed; the rest stay live.
    fn consume_offers_for(&self, accepted: &[&TaskPlacement]) {
        let mut to_consume: Vec<OfferId> = Vec::new();
        let mut seen: HashSet<OfferId> = HashSet::new();

        if !self.config.multi_task_per_offer {
            for placement in accepted {
                for offer_id in &placement.offer_ids {
                    if seen.insert(offer_id.clone()) {
                        to_consume.push(offer_id.clone());
                    }
                }
            }
        } else {
            let mut per_agent: HashMap<&str, (ResourceSet, &[OfferId])> = HashMap::new();
            for placement in accepted {
                let entry = per_agent
                    .entry(placement.agent_id.as_str())
                    .or_insert_with(|| (ResourceSet::zero(), &placement.offer_ids[..]));
                entry.0 = entry.0.add(&placement.task.resources);
            }
            for (_, (needed, offer_ids)) in per_agent {
                let mut covered = ResourceSet::zero();
                for offer_id in offer_ids {
                    if covered.fits(&needed) {
                        break;
                    }
                    if let Some(resources) = self.offers.offer_resources(offer_id) {
                        covered = covered.add(&resources);
                    }
                    if seen.insert(offer_id.clone()) {
                        to_consume.push(offer_id.clone());
                    }
                }
            }
        }

        if !to_consume.is_empty() {
            self.offers.consume_offers(&to_consume);
        }
    }

    fn build_group_views(
        &self,
        snapshots: &[AgentSnapshot],
        failures: &[PlacementFailure],
        now_ms: u64,
    ) -> Vec<GroupView> {
        let attribute = &self.config.autoscale_by_attribute_name;
        let mut by_group: HashMap<String, Vec<&AgentSnapshot>> = HashMap::new();
        for snapshot in snapshots {
            if let Some(group) = snapshot.agent.attributes.get(attribute) {
                by_group.entry(group.clone()).or_default().push(snapshot);
            }
        }

        let tier_groups = self.tier_groups.lock().unwrap().clone();
        let mut shortfalls: HashMap<String, ResourceSet> = HashMap::new();
        for failure in failures {
            if let Some(group) = tier_groups.get(&failure.tier) {
                let entry = shortfalls.entry(group.clone()).or_default();
                *entry = entry.add(&failure.resources);
            }
        }

        let group_ids: HashSet<String> = by_group
            .keys()
            .cloned()
            .chain(shortfalls.keys().cloned())
            .collect();

        let group_slots = self.group_slots.lock().unwrap();
        let default_slot = ResourceSet::from_cpu_memory(
            self.config.idle_machine_cpu_threshold,
            self.config.idle_machine_memory_mb_threshold,
        );
        let mut idle_since = self.idle_since.lock().unwrap();
        let autoscaler = self.autoscaler.lock().unwrap();

        let mut views = Vec::new();
        for group_id in group_ids {
            let Some(rule) = autoscaler.rule(&group_id) else {
                continue;
            };
            let agents = by_group.get(&group_id).map(Vec::as_slice).unwrap_or(&[]);

            let mut idle_agents = Vec::new();
            for snapshot in agents {
                let agent = &snapshot.agent;
                let is_idle = agent.is_enabled(now_ms)
                    && agent.available.cpus >= self.config.idle_machine_cpu_threshold
                    && agent.available.memory_mb >= self.config.idle_machine_memory_mb_threshold;
                if is_idle {
                    let since = *idle_since.entry(agent.id.clone()).or_insert(now_ms);
                    idle_agents.push(IdleAgent {
                        agent_id: agent.id.clone(),
                        idle_since_ms: since,
                    });
                } else {
                    idle_since.remove(&agent.id);
                }
            }

            views.push(GroupView {
                group: rule.clone(),
                current_size: agents.len() as u32,
                idle_agents,
                shortfall: shortfalls.get(&group_id).cloned().unwrap_or_default(),
                typical_slot: group_slots
                    .get(&group_id)
                    .cloned()
                    .unwrap_or_else(|| default_slot.clone()),
            });
        }
        views
    }

    fn execute_scale_action(&self, action: &ScaleAction) {
        match action {
            ScaleAction::Up { group_id, count } => {
                self.metrics.autoscale_up_actions.increment();
                if let Err(e) = self.cluster.scale_up(group_id, *count) {
                    warn!(group = %group_id, error = %e, "scale-up failed");
                }
            }
            ScaleAction::Down {
                group_id,
                instance_ids,
            } => {
                self.metrics.autoscale_down_actions.increment();
                match self.cluster.scale_down(group_id, instance_ids.clone()) {
                    Ok(outcome) => {
                        // Instances the cluster declined to terminate go
                        // back into rotation.
                        for agent_id in outcome.not_terminated {
                            self.offers.enable(&agent_id);
                        }
                    }
                    Err(e) => warn!(group = %group_id, error = %e, "scale-down failed"),
                }
            }
        }
    }

    fn deliver_failure_callbacks(&self, failures: &[PlacementFailure]) {
        let registered: Vec<(TaskId, oneshot::Sender<Option<PlacementFailure>>)> = {
            let mut actions = self.failure_actions.lock().unwrap();
            actions.drain(..).collect()
        };
        for (task_id, sender) in registered {
            let hit = failures.iter().find(|f| f.task_id == task_id).cloned();
            let _ = sender.send(hit);
        }
    }

    fn publish_fleet_metrics(&self, snapshots: &[AgentSnapshot], now_ms: u64, failed: usize) {
        let mut usage = FleetUsage::default();
        for snapshot in snapshots {
            let agent = &snapshot.agent;
            usage.total_cpus += agent.total.cpus;
            usage.allocated_cpus += agent.total.cpus - agent.available.cpus;
            usage.total_memory_mb += agent.total.memory_mb;
            usage.allocated_memory_mb += agent.total.memory_mb - agent.available.memory_mb;
            usage.total_network_mbps += agent.total.network_mbps;
            usage.allocated_network_mbps +=
                agent.total.network_mbps - agent.available.network_mbps;
            let disable_left = agent.disabled_until_ms.saturating_sub(now_ms);
            if disable_left > 0 {
                usage.disabled_agents += 1;
                usage.max_disable_duration_ms = usage.max_disable_duration_ms.max(disable_left);
                usage.min_disable_duration_ms = if usage.min_disable_duration_ms == 0 {
                    disable_left
                } else {
                    usage.min_disable_duration_ms.min(disable_left)
                };
            }
        }

        let m = &self.metrics;
        m.active_agents.set(snapshots.len() as u64);
        m.disabled_agents.set(usage.disabled_agents);
        m.min_disable_duration_ms.set(usage.min_disable_duration_ms);
        m.max_disable_duration_ms.set(usage.max_disable_duration_ms);
        m.total_available_cpus.set(usage.total_cpus as u64);
        m.total_allocated_cpus.set(usage.allocated_cpus as u64);
        m.total_available_memory_mb.set(usage.total_memory_mb);
        m.total_allocated_memory_mb.set(usage.allocated_memory_mb);
        m.total_available_network_mbps.set(usage.total_network_mbps);
        m.total_allocated_network_mbps
            .set(usage.allocated_network_mbps);
        m.cpu_utilization.set(usage.cpu_utilization_pct());
        m.memory_utilization.set(usage.memory_utilization_pct());
        m.network_utilization.set(usage.network_utilization_pct());
        m.dominant_resource_utilization
            .set(usage.dominant_resource_utilization_pct());
        m.pending_workers.set(failed as u64);
        m.queued_critical.set(self.queue.len(Tier::Critical) as u64);
        m.queued_flex.set(self.queue.len(Tier::Flex) as u64);
    }

    /// A fatal aggregate error: dump state (bounded by three iteration
    /// budgets) and, when configured, terminate the process with exit
    /// code 3.
    fn handle_fatal(&self, message: &str) {
        error!(%message, "fatal scheduling error");
        if self.config.exit_on_scheduling_error_enabled {
            let budget =
                Duration::from_millis(self.config.max_delay_ms_between_iterations.saturating_mul(3));
            self.dump_state(budget);
            std::process::exit(3);
        }
    }

    /// Best-effort JSON dump of the fleet and queue state. Serialization
    /// runs off-thread; if it does not finish within `budget`, the dump is
    /// abandoned so the process can still exit promptly.
    fn dump_state(&self, budget: Duration) {
        let snapshots = self.offers.snapshot(epoch_ms());
        let agents: Vec<AgentState> = snapshots.into_iter().map(|s| s.agent).collect();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(serde_json::to_string(&agents));
        });
        match rx.recv_timeout(budget) {
            Ok(Ok(dump)) => error!(dump = %dump, "agent state dump"),
            Ok(Err(e)) => error!(error = %e, "failed to serialize agent state dump"),
            Err(_) => error!(
                budget_ms = budget.as_millis() as u64,
                "timed out waiting for agent state dump"
            ),
        }
        error!(
            queued_critical = self.queue.len(Tier::Critical),
            queued_flex = self.queue.len(Tier::Flex),
            "task queue dump"
        );
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
