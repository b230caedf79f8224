//! Constraint registry and the composite evaluator.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use tracing::warn;

use flotilla_types::{AgentState, Task};

use crate::constraint::{Decision, EvaluationContext, HardConstraint, SoftConstraint};

/// Named constraint implementations tasks can reference.
#[derive(Default)]
pub struct ConstraintRegistry {
    hard: HashMap<String, Arc<dyn HardConstraint>>,
    soft: HashMap<String, Arc<dyn SoftConstraint>>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_hard(&mut self, constraint: Arc<dyn HardConstraint>) {
        self.hard.insert(constraint.name().to_string(), constraint);
    }

    pub fn register_soft(&mut self, constraint: Arc<dyn SoftConstraint>) {
        self.soft.insert(constraint.name().to_string(), constraint);
    }

    pub fn hard(&self, name: &str) -> Option<&Arc<dyn HardConstraint>> {
        self.hard.get(name)
    }

    pub fn soft(&self, name: &str) -> Option<&Arc<dyn SoftConstraint>> {
        self.soft.get(name)
    }
}

/// Applies the fleet-global constraints plus each task's own, in the order
/// the engine needs: hard admission first, then fitness scoring.
pub struct CompositeEvaluator {
    registry: ConstraintRegistry,
    global_hard: Arc<dyn HardConstraint>,
    global_soft: Arc<dyn SoftConstraint>,
    fitness_good_enough: f64,
}

impl CompositeEvaluator {
    pub fn new(
        registry: ConstraintRegistry,
        global_hard: Arc<dyn HardConstraint>,
        global_soft: Arc<dyn SoftConstraint>,
        fitness_good_enough: f64,
    ) -> Self {
        Self {
            registry,
            global_hard,
            global_soft,
            fitness_good_enough,
        }
    }

    /// Scanning may stop once a candidate scores at or above this.
    pub fn fitness_good_enough(&self) -> f64 {
        self.fitness_good_enough
    }

    /// Pre-iteration hook: refresh the global constraint and every
    /// registered hard constraint.
    pub fn prepare(&self) {
        self.global_hard.prepare();
        for constraint in self.registry.hard.values() {
            constraint.prepare();
        }
    }

    /// Global hard constraint AND the task's named hard constraints. The
    /// first rejection wins and carries its reason. A constraint that
    /// errors is logged and treated as a rejection, so the task stays
    /// queued instead of poisoning the iteration.
    pub fn admit(&self, task: &Task, agent: &AgentState, ctx: &EvaluationContext) -> Decision {
        let global = evaluate_hard(self.global_hard.as_ref(), task, agent, ctx);
        if !global.ok {
            return global;
        }
        for name in &task.hard_constraints {
            match self.registry.hard(name) {
                Some(constraint) => {
                    let decision = evaluate_hard(constraint.as_ref(), task, agent, ctx);
                    if !decision.ok {
                        return decision;
                    }
                }
                None => return Decision::reject(format!("unknown constraint {name}")),
            }
        }
        Decision::admit()
    }

    /// Weighted composite fitness: the global score carries weight 1, each
    /// of the task's soft constraints its own weight; the result is
    /// normalized back into `[0, 1]`. A scorer that errors is logged and
    /// contributes zero.
    pub fn fitness(&self, task: &Task, agent: &AgentState, ctx: &EvaluationContext) -> f64 {
        let mut total = score_soft(self.global_soft.as_ref(), task, agent, ctx);
        let mut weight_sum = 1.0;
        for reference in &task.soft_constraints {
            if reference.weight <= 0.0 {
                continue;
            }
            let score = match self.registry.soft(&reference.name) {
                Some(constraint) => score_soft(constraint.as_ref(), task, agent, ctx),
                None => {
                    warn!(name = %reference.name, task_id = %task.id, "unknown soft constraint");
                    0.0
                }
            };
            total += score * reference.weight;
            weight_sum += reference.weight;
        }
        total / weight_sum
    }
}

fn evaluate_hard(
    constraint: &dyn HardConstraint,
    task: &Task,
    agent: &AgentState,
    ctx: &EvaluationContext,
) -> Decision {
    match constraint.evaluate(task, agent, ctx) {
        Ok(decision) => decision,
        Err(e) => {
            warn!(
                constraint = constraint.name(),
                task_id = %task.id,
                agent = %agent.id,
                error = %e,
                "hard constraint failed to evaluate"
            );
            Decision::reject(format!("constraint {} failed", constraint.name()))
        }
    }
}

fn score_soft(
    constraint: &dyn SoftConstraint,
    task: &Task,
    agent: &AgentState,
    ctx: &EvaluationContext,
) -> f64 {
    match constraint.score(task, agent, ctx) {
        Ok(score) => score.clamp(0.0, 1.0),
        Err(e) => {
            warn!(
                constraint = constraint.name(),
                task_id = %task.id,
                agent = %agent.id,
                error = %e,
                "soft constraint failed to score"
            );
            0.0
        }
    }
}

/// Deterministic ordering between two admissible, equally scored agents:
/// fewer tasks assigned this iteration, then more remaining cpu, then a
/// stable hash of (agent id, task id). Returns `Less` when `a` wins.
pub fn tie_break(
    a: &AgentState,
    b: &AgentState,
    task: &Task,
    ctx: &EvaluationContext,
) -> Ordering {
    ctx.assigned_on(&a.id)
        .cmp(&ctx.assigned_on(&b.id))
        .then_with(|| {
            b.available
                .cpus
                .partial_cmp(&a.available.cpus)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| pair_hash(&a.id, &task.id).cmp(&pair_hash(&b.id, &task.id)))
}

fn pair_hash(agent_id: &str, task_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    agent_id.hash(&mut hasher);
    task_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_types::{ResourceSet, Tier};

    struct AlwaysAdmit;
    impl HardConstraint for AlwaysAdmit {
        fn name(&self) -> &str {
            "always-admit"
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

    struct RejectAll;
    impl HardConstraint for RejectAll {
        fn name(&self) -> &str {
            "reject-all"
        }
        fn evaluate(
            &self,
            _: &Task,
            _: &AgentState,
            _: &EvaluationContext,
        ) -> anyhow::Result<Decision> {
            Ok(Decision::reject("rejected by policy"))
        }
    }

    struct BrokenHard;
    impl HardConstraint for BrokenHard {
        fn name(&self) -> &str {
            "broken-hard"
        }
        fn evaluate(
            &self,
            _: &Task,
            _: &AgentState,
            _: &EvaluationContext,
        ) -> anyhow::Result<Decision> {
            Err(anyhow::anyhow!("lookup backend unreachable"))
        }
    }

    struct FixedScore(f64);
    impl SoftConstraint for FixedScore {
        fn name(&self) -> &str {
            "fixed"
        }
        fn score(&self, _: &Task, _: &AgentState, _: &EvaluationContext) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    struct BrokenSoft;
    impl SoftConstraint for BrokenSoft {
        fn name(&self) -> &str {
            "broken-soft"
        }
        fn score(&self, _: &Task, _: &AgentState, _: &EvaluationContext) -> anyhow::Result<f64> {
            Err(anyhow::anyhow!("scorer blew up"))
        }
    }

    fn task() -> Task {
        Task::new("t1", "job-1", ResourceSet::from_cpu_memory(1.0, 512), Tier::Flex, "default")
    }

    fn agent(id: &str, cpus: f64) -> AgentState {
        let mut a = AgentState::new(id, format!("{id}.example"));
        a.available = ResourceSet::from_cpu_memory(cpus, 4096);
        a
    }

    fn ctx() -> EvaluationContext {
        EvaluationContext::new(0, "active", "zone")
    }

    fn evaluator(registry: ConstraintRegistry) -> CompositeEvaluator {
        CompositeEvaluator::new(
            registry,
            Arc::new(AlwaysAdmit),
            Arc::new(FixedScore(0.5)),
            0.9,
        )
    }

    #[test]
    fn global_rejection_short_circuits() {
        let evaluator = CompositeEvaluator::new(
            ConstraintRegistry::new(),
            Arc::new(RejectAll),
            Arc::new(FixedScore(1.0)),
            0.9,
        );
        let decision = evaluator.admit(&task(), &agent("a1", 4.0), &ctx());
        assert!(!decision.ok);
        assert_eq!(decision.reason, "rejected by policy");
    }

    #[test]
    fn unknown_hard_constraint_rejects() {
        let evaluator = evaluator(ConstraintRegistry::new());
        let t = task().with_hard_constraint("no-such-thing");
        let decision = evaluator.admit(&t, &agent("a1", 4.0), &ctx());
        assert!(!decision.ok);
        assert!(decision.reason.contains("no-such-thing"));
    }

    #[test]
    fn per_task_hard_constraints_and_compose() {
        let mut registry = ConstraintRegistry::new();
        registry.register_hard(Arc::new(RejectAll));
        let evaluator = evaluator(registry);

        let clean = task();
        assert!(evaluator.admit(&clean, &agent("a1", 4.0), &ctx()).ok);

        let constrained = task().with_hard_constraint("reject-all");
        assert!(!evaluator.admit(&constrained, &agent("a1", 4.0), &ctx()).ok);
    }

    #[test]
    fn fitness_is_weight_normalized() {
        let mut registry = ConstraintRegistry::new();
        registry.register_soft(Arc::new(FixedScore(1.0)));
        let evaluator = evaluator(registry);

        // global 0.5 (weight 1) + fixed 1.0 (weight 3) -> 3.5 / 4.
        let t = task().with_soft_constraint("fixed", 3.0);
        let score = evaluator.fitness(&t, &agent("a1", 4.0), &ctx());
        assert!((score - 0.875).abs() < 1e-9);
    }

    #[test]
    fn erroring_hard_constraint_rejects_instead_of_propagating() {
        let mut registry = ConstraintRegistry::new();
        registry.register_hard(Arc::new(BrokenHard));
        let evaluator = evaluator(registry);

        let t = task().with_hard_constraint("broken-hard");
        let decision = evaluator.admit(&t, &agent("a1", 4.0), &ctx());
        assert!(!decision.ok);
        assert_eq!(decision.reason, "constraint broken-hard failed");
    }

    #[test]
    fn erroring_global_hard_constraint_rejects() {
        let evaluator = CompositeEvaluator::new(
            ConstraintRegistry::new(),
            Arc::new(BrokenHard),
            Arc::new(FixedScore(1.0)),
            0.9,
        );
        let decision = evaluator.admit(&task(), &agent("a1", 4.0), &ctx());
        assert!(!decision.ok);
    }

    #[test]
    fn erroring_soft_constraint_scores_zero() {
        let mut registry = ConstraintRegistry::new();
        registry.register_soft(Arc::new(BrokenSoft));
        let evaluator = evaluator(registry);

        // global 0.5 (weight 1) + broken 0.0 (weight 1) -> 0.25.
        let t = task().with_soft_constraint("broken-soft", 1.0);
        let score = evaluator.fitness(&t, &agent("a1", 4.0), &ctx());
        assert!((score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_soft_constraints_ignored() {
        let evaluator = evaluator(ConstraintRegistry::new());
        let t = task().with_soft_constraint("anything", 0.0);
        let score = evaluator.fitness(&t, &agent("a1", 4.0), &ctx());
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn tie_break_prefers_less_loaded_then_more_cpu() {
        let t = task();
        let mut context = ctx();
        let a = agent("a1", 4.0);
        let b = agent("a2", 8.0);

        // Equal load: larger remaining cpu wins.
        assert_eq!(tie_break(&b, &a, &t, &context), Ordering::Less);

        // Load beats cpu.
        context.record_assignment(&b);
        assert_eq!(tie_break(&a, &b, &t, &context), Ordering::Less);
    }

    #[test]
    fn tie_break_falls_back_to_stable_hash() {
        let t = task();
        let context = ctx();
        let a = agent("a1", 4.0);
        let b = agent("a2", 4.0);
        let first = tie_break(&a, &b, &t, &context);
        // Stable across repeated evaluations in the same process.
        assert_eq!(first, tie_break(&a, &b, &t, &context));
        assert_ne!(first, Ordering::Equal);
    }
}
