//! The pure matching core of one placement iteration.
//!
//! `plan_iteration` works entirely on snapshots and working copies: agents'
//! remaining resources are deducted as tasks are matched, so two tasks in
//! the same iteration can never over-commit an offer. The caller applies
//! the resulting plan (launch callbacks, offer consumption, queue removal).

use std::time::Instant;

use tracing::{debug, warn};

use flotilla_constraints::{tie_break, CompositeEvaluator, EvaluationContext};
use flotilla_offers::AgentSnapshot;
use flotilla_types::{AgentId, AgentState, OfferId, ResourceSet, Task, TaskId, Tier};

/// One task→agent assignment, with the offers backing it.
#[derive(Debug, Clone)]
pub struct TaskPlacement {
    pub task: Task,
    pub agent_id: AgentId,
    pub hostname: String,
    /// Offers consumed by this agent's assignments (keep-together: the
    /// agent's whole live offer set unless the engine splits offers).
    pub offer_ids: Vec<OfferId>,
}

/// Why a task stayed queued this iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementFailure {
    pub task_id: TaskId,
    pub tier: Tier,
    pub capacity_group: String,
    /// The unmet request, for shortfall accounting.
    pub resources: ResourceSet,
    pub reason: String,
}

/// Everything one iteration decided.
#[derive(Debug, Default)]
pub struct IterationPlan {
    pub placements: Vec<TaskPlacement>,
    pub failures: Vec<PlacementFailure>,
    /// Tasks skipped because the iteration ran out of budget; they stay
    /// queued with no failure record.
    pub deferred: Vec<TaskId>,
}

struct WorkingAgent {
    state: AgentState,
    offer_ids: Vec<OfferId>,
    assigned: Vec<usize>,
}

/// Match the ordered task view against the placeable agents.
///
/// `deadline`, when set, bounds the iteration: once passed, remaining
/// tasks are deferred to the next tick after the current task finishes
/// evaluating. A deferred task is never partially launched.
pub fn plan_iteration(
    tasks: &[Task],
    agents: &[AgentSnapshot],
    evaluator: &CompositeEvaluator,
    ctx: &mut EvaluationContext,
    deadline: Option<Instant>,
) -> IterationPlan {
    let mut plan = IterationPlan::default();
    let mut working: Vec<WorkingAgent> = agents
        .iter()
        .filter(|snapshot| snapshot.is_placeable(ctx.now_ms))
        .map(|snapshot| WorkingAgent {
            state: snapshot.agent.clone(),
            offer_ids: snapshot.offer_ids.clone(),
            assigned: Vec::new(),
        })
        .collect();

    let good_enough = evaluator.fitness_good_enough();

    for (task_index, task) in tasks.iter().enumerate() {
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            warn!(
                remaining = tasks.len() - task_index,
                "iteration budget exhausted, deferring remaining tasks"
            );
            plan.deferred = tasks[task_index..].iter().map(|t| t.id.clone()).collect();
            break;
        }

        let mut best: Option<(usize, f64)> = None;
        let mut constraint_reason: Option<String> = None;
        let mut resource_reason: Option<String> = None;

        for (index, agent) in working.iter().enumerate() {
            let decision = evaluator.admit(task, &agent.state, ctx);
            if !decision.ok {
                constraint_reason.get_or_insert(decision.reason);
                continue;
            }
            if !agent.state.available.fits(&task.resources) {
                resource_reason
                    .get_or_insert_with(|| insufficiency_reason(&agent.state.available, &task.resources));
                continue;
            }
            let score = evaluator.fitness(task, &agent.state, ctx);
            let better = match best {
                None => true,
                Some((best_index, best_score)) => {
                    score > best_score
                        || (score == best_score
                            && tie_break(&agent.state, &working[best_index].state, task, ctx)
                                .is_lt())
                }
            };
            if better {
                best = Some((index, score));
                if score >= good_enough {
                    // Good enough: stop scanning further agents.
                    break;
                }
            }
        }

        match best {
            Some((index, score)) => {
                let agent = &mut working[index];
                // fits() was checked above.
                if let Some(remaining) = agent.state.available.checked_sub(&task.resources) {
                    agent.state.available = remaining;
                }
                agent.assigned.push(task_index);
                ctx.record_assignment(&agent.state);
                debug!(task_id = %task.id, agent = %agent.state.id, score, "task matched");
                plan.placements.push(TaskPlacement {
                    task: task.clone(),
                    agent_id: agent.state.id.clone(),
                    hostname: agent.state.hostname.clone(),
                    offer_ids: agent.offer_ids.clone(),
                });
            }
            None => {
                let reason = resource_reason
                    .or(constraint_reason)
                    .unwrap_or_else(|| "no active agents".to_string());
                plan.failures.push(PlacementFailure {
                    task_id: task.id.clone(),
                    tier: task.tier,
                    capacity_group: task.capacity_group.clone(),
                    resources: task.resources.clone(),
                    reason,
                });
            }
        }
    }

    plan
}

/// Name the first resource dimension that does not fit.
fn insufficiency_reason(available: &ResourceSet, request: &ResourceSet) -> String {
    if request.cpus > available.cpus {
        "insufficient cpu".into()
    } else if request.memory_mb > available.memory_mb {
        "insufficient memory".into()
    } else if request.disk_mb > available.disk_mb {
        "insufficient disk".into()
    } else if request.network_mbps > available.network_mbps {
        "insufficient network".into()
    } else if request.gpus > available.gpus {
        "insufficient gpus".into()
    } else if request.ports > available.ports {
        "insufficient ports".into()
    } else {
        for (name, amount) in &request.scalars {
            if *amount > available.scalars.get(name).copied().unwrap_or(0.0) {
                return format!("insufficient {name}");
            }
        }
        "insufficient resources".into()
    }
}
