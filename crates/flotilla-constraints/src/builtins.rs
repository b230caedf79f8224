//! Built-in constraint and fitness implementations.

use flotilla_types::{AgentState, Task};

use crate::constraint::{Decision, EvaluationContext, HardConstraint, SoftConstraint};

/// Fleet-global hard constraint: the agent must carry the active-agent
/// attribute with the expected value. Drain-only agents keep their offers
/// but stop receiving work.
pub struct ActiveAgentConstraint {
    expected_value: String,
}

impl ActiveAgentConstraint {
    pub fn new(expected_value: impl Into<String>) -> Self {
        Self {
            expected_value: expected_value.into(),
        }
    }
}

impl Default for ActiveAgentConstraint {
    fn default() -> Self {
        Self::new("true")
    }
}

impl HardConstraint for ActiveAgentConstraint {
    fn name(&self) -> &str {
        "active-agent"
    }

    fn evaluate(
        &self,
        _task: &Task,
        agent: &AgentState,
        ctx: &EvaluationContext,
    ) -> anyhow::Result<Decision> {
        Ok(match agent.attributes.get(&ctx.active_agent_attribute) {
            Some(value) if *value == self.expected_value => Decision::admit(),
            _ => Decision::reject(format!("agent {} is not active", agent.id)),
        })
    }
}

/// Hard constraint requiring an exact agent-attribute match.
pub struct AttributeEqualsConstraint {
    name: String,
    attribute: String,
    expected: String,
}

impl AttributeEqualsConstraint {
    pub fn new(
        name: impl Into<String>,
        attribute: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            attribute: attribute.into(),
            expected: expected.into(),
        }
    }
}

impl HardConstraint for AttributeEqualsConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        _task: &Task,
        agent: &AgentState,
        _ctx: &EvaluationContext,
    ) -> anyhow::Result<Decision> {
        Ok(match agent.attributes.get(&self.attribute) {
            Some(value) if *value == self.expected => Decision::admit(),
            Some(value) => Decision::reject(format!(
                "attribute {} is {value}, expected {}",
                self.attribute, self.expected
            )),
            None => Decision::reject(format!("attribute {} missing", self.attribute)),
        })
    }
}

/// Hard constraint rejecting agents with a drained named-consumable pool.
///
/// An agent advertising a consumable pool at zero has no slots left for any
/// task, whether or not the task requests that consumable.
pub struct ConsumablePoolsConstraint;

impl HardConstraint for ConsumablePoolsConstraint {
    fn name(&self) -> &str {
        "consumable-pools"
    }

    fn evaluate(
        &self,
        _task: &Task,
        agent: &AgentState,
        _ctx: &EvaluationContext,
    ) -> anyhow::Result<Decision> {
        for (pool, remaining) in &agent.available.scalars {
            if *remaining <= 0.0 {
                return Ok(Decision::reject(format!("consumable pool {pool} drained")));
            }
        }
        Ok(Decision::admit())
    }
}

/// Fleet-global soft constraint: prefer agents that will be fuller after
/// placement (bin packing keeps whole agents free for large tasks and for
/// scale-down).
pub struct BinPackingFitness;

impl SoftConstraint for BinPackingFitness {
    fn name(&self) -> &str {
        "bin-packing"
    }

    fn score(&self, task: &Task, agent: &AgentState, _ctx: &EvaluationContext) -> anyhow::Result<f64> {
        if agent.total.cpus <= 0.0 {
            return Ok(0.0);
        }
        let used = agent.total.cpus - agent.available.cpus;
        let projected = used + task.resources.cpus;
        Ok((projected / agent.total.cpus).clamp(0.0, 1.0))
    }
}

/// Soft constraint preferring zones with fewer assignments this iteration.
pub struct ZoneSpreadFitness;

impl SoftConstraint for ZoneSpreadFitness {
    fn name(&self) -> &str {
        "zone-spread"
    }

    fn score(&self, _task: &Task, agent: &AgentState, ctx: &EvaluationContext) -> anyhow::Result<f64> {
        Ok(match agent.zone(&ctx.zone_attribute) {
            Some(zone) => 1.0 / (1.0 + ctx.assigned_in_zone(zone) as f64),
            // No zone tag: neutral.
            None => 0.5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_types::{ResourceSet, Tier};

    fn task(cpus: f64) -> Task {
        Task::new("t1", "job-1", ResourceSet::from_cpu_memory(cpus, 512), Tier::Flex, "default")
    }

    fn ctx() -> EvaluationContext {
        EvaluationContext::new(0, "active", "zone")
    }

    #[test]
    fn active_agent_requires_attribute() {
        let constraint = ActiveAgentConstraint::default();
        let active = AgentState::new("a1", "h1").with_attribute("active", "true");
        let draining = AgentState::new("a2", "h2").with_attribute("active", "false");
        let untagged = AgentState::new("a3", "h3");

        assert!(constraint.evaluate(&task(1.0), &active, &ctx()).unwrap().ok);
        assert!(!constraint.evaluate(&task(1.0), &draining, &ctx()).unwrap().ok);
        assert!(!constraint.evaluate(&task(1.0), &untagged, &ctx()).unwrap().ok);
    }

    #[test]
    fn attribute_equals_reports_mismatch() {
        let constraint = AttributeEqualsConstraint::new("needs-m5", "family", "m5");
        let m5 = AgentState::new("a1", "h1").with_attribute("family", "m5");
        let r5 = AgentState::new("a2", "h2").with_attribute("family", "r5");

        assert!(constraint.evaluate(&task(1.0), &m5, &ctx()).unwrap().ok);
        let rejection = constraint.evaluate(&task(1.0), &r5, &ctx()).unwrap();
        assert!(rejection.reason.contains("r5"));
    }

    #[test]
    fn drained_pool_rejects_even_cpu_only_tasks() {
        let constraint = ConsumablePoolsConstraint;
        let mut agent = AgentState::new("a1", "h1");
        agent.available = ResourceSet::from_cpu_memory(8.0, 8192).with_scalar("gpus", 0.0);

        let cpu_only = task(1.0);
        assert_eq!(cpu_only.resources.gpus, 0);
        let decision = constraint.evaluate(&cpu_only, &agent, &ctx()).unwrap();
        assert!(!decision.ok);
        assert!(decision.reason.contains("gpus"));
    }

    #[test]
    fn healthy_pool_admits() {
        let constraint = ConsumablePoolsConstraint;
        let mut agent = AgentState::new("a1", "h1");
        agent.available = ResourceSet::from_cpu_memory(8.0, 8192).with_scalar("gpus", 2.0);
        assert!(constraint.evaluate(&task(1.0), &agent, &ctx()).unwrap().ok);
    }

    #[test]
    fn bin_packing_prefers_fuller_agent() {
        let fitness = BinPackingFitness;
        let mut fuller = AgentState::new("a1", "h1");
        fuller.total = ResourceSet::from_cpu_memory(8.0, 8192);
        fuller.available = ResourceSet::from_cpu_memory(2.0, 2048);

        let mut empty = AgentState::new("a2", "h2");
        empty.total = ResourceSet::from_cpu_memory(8.0, 8192);
        empty.available = ResourceSet::from_cpu_memory(8.0, 8192);

        let t = task(1.0);
        assert!(
            fitness.score(&t, &fuller, &ctx()).unwrap() > fitness.score(&t, &empty, &ctx()).unwrap()
        );
    }

    #[test]
    fn zone_spread_penalizes_crowded_zone() {
        let fitness = ZoneSpreadFitness;
        let z1 = AgentState::new("a1", "h1").with_attribute("zone", "z1");
        let z2 = AgentState::new("a2", "h2").with_attribute("zone", "z2");

        let mut context = ctx();
        context.record_assignment(&z1);

        let t = task(1.0);
        assert!(
            fitness.score(&t, &z2, &context).unwrap() > fitness.score(&t, &z1, &context).unwrap()
        );
    }
}
