//! The autoscale controller.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use flotilla_types::{AgentId, InstanceGroup, ResourceSet};

use crate::evaluators::{
    LongestIdleFirst, NaiveShortfallEvaluator, ScaleDownConstraintEvaluator,
    ScaleDownOrderEvaluator, ShortfallEvaluator,
};

/// An abstract scaling decision. Execution belongs to the
/// [`ClusterManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    Up {
        group_id: String,
        count: u32,
    },
    Down {
        group_id: String,
        instance_ids: Vec<AgentId>,
    },
}

/// Result of a scale-down request: which instances actually went away.
#[derive(Debug, Clone, Default)]
pub struct ScaleDownOutcome {
    pub terminated: Vec<AgentId>,
    pub not_terminated: Vec<AgentId>,
}

/// External cluster management collaborator.
pub trait ClusterManager: Send + Sync {
    fn scale_up(&self, group_id: &str, count: u32) -> anyhow::Result<()>;

    fn scale_down(
        &self,
        group_id: &str,
        instance_ids: Vec<AgentId>,
    ) -> anyhow::Result<ScaleDownOutcome>;
}

/// Instance-group membership change, mirrored from the cluster manager's
/// event stream.
#[derive(Debug, Clone)]
pub enum InstanceGroupEvent {
    Updated(InstanceGroup),
    Removed(String),
}

/// An idle agent eligible for scale-down.
#[derive(Debug, Clone)]
pub struct IdleAgent {
    pub agent_id: AgentId,
    pub idle_since_ms: u64,
}

/// One instance group's post-iteration view.
#[derive(Debug, Clone)]
pub struct GroupView {
    pub group: InstanceGroup,
    pub current_size: u32,
    pub idle_agents: Vec<IdleAgent>,
    /// Queued resource demand this group could not place.
    pub shortfall: ResourceSet,
    /// Typical per-instance slot, for converting shortfall into a count.
    pub typical_slot: ResourceSet,
}

#[derive(Default)]
struct GroupScaleState {
    last_scale_up_ms: Option<u64>,
    last_scale_down_ms: Option<u64>,
    shortfall_since_ms: Option<u64>,
    excess_idle_since_ms: Option<u64>,
    /// Instances requested but not yet observed in the group size.
    pending_scale_up: u32,
    expected_size: u32,
}

/// Emits scale-up/down actions per instance group, honoring hysteresis
/// delays, cooldowns, and the group's idle floor.
pub struct AutoscaleController {
    rules: HashMap<String, InstanceGroup>,
    states: HashMap<String, GroupScaleState>,
    order_evaluator: Arc<dyn ScaleDownOrderEvaluator>,
    constraint_evaluators: Vec<(Arc<dyn ScaleDownConstraintEvaluator>, f64)>,
    shortfall_evaluator: Arc<dyn ShortfallEvaluator>,
    delay_up_ms: u64,
    delay_down_ms: u64,
}

impl AutoscaleController {
    pub fn new(delay_up_secs: u64, delay_down_secs: u64) -> Self {
        Self {
            rules: HashMap::new(),
            states: HashMap::new(),
            order_evaluator: Arc::new(LongestIdleFirst),
            constraint_evaluators: Vec::new(),
            shortfall_evaluator: Arc::new(NaiveShortfallEvaluator),
            delay_up_ms: delay_up_secs * 1000,
            delay_down_ms: delay_down_secs * 1000,
        }
    }

    pub fn with_order_evaluator(mut self, evaluator: Arc<dyn ScaleDownOrderEvaluator>) -> Self {
        self.order_evaluator = evaluator;
        self
    }

    pub fn with_constraint_evaluator(
        mut self,
        evaluator: Arc<dyn ScaleDownConstraintEvaluator>,
        weight: f64,
    ) -> Self {
        self.constraint_evaluators.push((evaluator, weight));
        self
    }

    pub fn with_shortfall_evaluator(mut self, evaluator: Arc<dyn ShortfallEvaluator>) -> Self {
        self.shortfall_evaluator = evaluator;
        self
    }

    /// Apply a rule add/update/remove from the cluster manager's stream.
    pub fn apply_group_event(&mut self, event: InstanceGroupEvent) {
        match event {
            InstanceGroupEvent::Updated(group) => {
                info!(group = %group.id, min = group.min, max = group.max, "autoscale rule updated");
                self.rules.insert(group.id.clone(), group);
            }
            InstanceGroupEvent::Removed(id) => {
                info!(group = %id, "autoscale rule removed");
                self.rules.remove(&id);
                self.states.remove(&id);
            }
        }
    }

    pub fn rule(&self, group_id: &str) -> Option<&InstanceGroup> {
        self.rules.get(group_id)
    }

    /// Evaluate every group view against its rule. Call once per placement
    /// iteration with the post-iteration fleet view.
    pub fn evaluate(&mut self, views: &[GroupView], now_ms: u64) -> Vec<ScaleAction> {
        let mut actions = Vec::new();
        for view in views {
            if !self.rules.contains_key(&view.group.id) {
                // Unknown groups are tracked only once a rule arrives.
                continue;
            }
            if let Some(action) = self.evaluate_group(view, now_ms) {
                actions.push(action);
            }
        }
        actions
    }

    fn evaluate_group(&mut self, view: &GroupView, now_ms: u64) -> Option<ScaleAction> {
        let group = &view.group;
        let state = self.states.entry(group.id.clone()).or_default();

        // Pending scale-up resolves once the group reaches its expected size.
        if view.current_size >= state.expected_size {
            state.pending_scale_up = 0;
        }

        let slots = self
            .shortfall_evaluator
            .shortfall_slots(view, state.pending_scale_up);

        // Scale-up path.
        if slots > 0 {
            let since = *state.shortfall_since_ms.get_or_insert(now_ms);
            let cooled = state
                .last_scale_up_ms
                .is_none_or(|t| now_ms.saturating_sub(t) >= u64::from(group.cool_down_sec) * 1000);
            if now_ms.saturating_sub(since) >= self.delay_up_ms && cooled {
                let desired = slots.saturating_mul(group.shortfall_adjusting_factor);
                let headroom = group.max.saturating_sub(view.current_size);
                let count = desired.min(headroom);
                if count > 0 {
                    state.last_scale_up_ms = Some(now_ms);
                    state.shortfall_since_ms = None;
                    state.pending_scale_up += count;
                    state.expected_size = view.current_size + count;
                    info!(group = %group.id, count, "scale-up triggered");
                    return Some(ScaleAction::Up {
                        group_id: group.id.clone(),
                        count,
                    });
                }
                debug!(group = %group.id, "scale-up wanted but group is at max");
            }
        } else {
            state.shortfall_since_ms = None;
        }

        // Scale-down path.
        let idle_count = view.idle_agents.len() as u32;
        if idle_count > group.max_idle_to_keep {
            let since = *state.excess_idle_since_ms.get_or_insert(now_ms);
            let cooled = state
                .last_scale_down_ms
                .is_none_or(|t| now_ms.saturating_sub(t) >= u64::from(group.cool_down_sec) * 1000);
            if now_ms.saturating_sub(since) >= self.delay_down_ms && cooled {
                let excess = idle_count - group.max_idle_to_keep;
                // Never terminate below max(min, min_idle_to_keep).
                let floor = group.scale_down_floor();
                let removable = view.current_size.saturating_sub(floor);
                let target = excess.min(removable);
                if target > 0 {
                    let instance_ids = pick_scale_down_candidates(
                        &*self.order_evaluator,
                        &self.constraint_evaluators,
                        view,
                        target as usize,
                    );
                    if !instance_ids.is_empty() {
                        state.last_scale_down_ms = Some(now_ms);
                        state.excess_idle_since_ms = None;
                        info!(group = %group.id, count = instance_ids.len(), "scale-down triggered");
                        return Some(ScaleAction::Down {
                            group_id: group.id.clone(),
                            instance_ids,
                        });
                    }
                }
            }
        } else {
            state.excess_idle_since_ms = None;
        }

        None
    }
}

/// Order candidates, then drop any the weighted constraint evaluators veto
/// (weighted average below 0.5).
fn pick_scale_down_candidates(
    order_evaluator: &dyn ScaleDownOrderEvaluator,
    constraint_evaluators: &[(Arc<dyn ScaleDownConstraintEvaluator>, f64)],
    view: &GroupView,
    target: usize,
) -> Vec<AgentId> {
    let ordered = order_evaluator.order(&view.idle_agents);
    let mut picked = Vec::new();
    for agent_id in ordered {
        if picked.len() >= target {
            break;
        }
        if termination_allowed(constraint_evaluators, &agent_id, view) {
            picked.push(agent_id);
        } else {
            debug!(agent = %agent_id, group = %view.group.id, "scale-down vetoed");
        }
    }
    picked
}

fn termination_allowed(
    constraint_evaluators: &[(Arc<dyn ScaleDownConstraintEvaluator>, f64)],
    agent_id: &str,
    view: &GroupView,
) -> bool {
    if constraint_evaluators.is_empty() {
        return true;
    }
    let mut total = 0.0;
    let mut weights = 0.0;
    for (evaluator, weight) in constraint_evaluators {
        if *weight <= 0.0 {
            continue;
        }
        let score = evaluator.evaluate(agent_id, view).clamp(0.0, 1.0);
        total += score * weight;
        weights += weight;
    }
    if weights == 0.0 {
        return true;
    }
    let average = total / weights;
    if average < 0.5 {
        warn!(agent = %agent_id, average, "termination forbidden by constraint evaluators");
        false
    } else {
        true
    }
}
