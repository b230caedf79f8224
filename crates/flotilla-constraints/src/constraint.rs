//! Constraint traits and the per-iteration evaluation context.

use std::collections::HashMap;

use flotilla_types::{AgentId, AgentState, Task};

/// Outcome of a hard-constraint evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub ok: bool,
    pub reason: String,
}

impl Decision {
    pub fn admit() -> Self {
        Self {
            ok: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }
}

/// Working state of one placement iteration, visible to constraints.
///
/// The engine records every assignment it makes so later candidates see the
/// iteration's own decisions (tie-breaks, zone balance).
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub now_ms: u64,
    /// Agent attribute distinguishing active agents.
    pub active_agent_attribute: String,
    /// Agent attribute naming the availability zone.
    pub zone_attribute: String,
    /// Tasks assigned per agent in this iteration.
    assigned_counts: HashMap<AgentId, usize>,
    /// Tasks assigned per zone in this iteration.
    zone_assigned_counts: HashMap<String, usize>,
}

impl EvaluationContext {
    pub fn new(
        now_ms: u64,
        active_agent_attribute: impl Into<String>,
        zone_attribute: impl Into<String>,
    ) -> Self {
        Self {
            now_ms,
            active_agent_attribute: active_agent_attribute.into(),
            zone_attribute: zone_attribute.into(),
            assigned_counts: HashMap::new(),
            zone_assigned_counts: HashMap::new(),
        }
    }

    /// Tasks assigned to `agent_id` so far in this iteration.
    pub fn assigned_on(&self, agent_id: &str) -> usize {
        self.assigned_counts.get(agent_id).copied().unwrap_or(0)
    }

    /// Tasks assigned into `zone` so far in this iteration.
    pub fn assigned_in_zone(&self, zone: &str) -> usize {
        self.zone_assigned_counts.get(zone).copied().unwrap_or(0)
    }

    /// Record an assignment the engine just made.
    pub fn record_assignment(&mut self, agent: &AgentState) {
        *self
            .assigned_counts
            .entry(agent.id.clone())
            .or_insert(0) += 1;
        if let Some(zone) = agent.zone(&self.zone_attribute) {
            *self
                .zone_assigned_counts
                .entry(zone.to_string())
                .or_insert(0) += 1;
        }
    }

    /// Release a previously recorded assignment (launch rejection).
    pub fn release_assignment(&mut self, agent: &AgentState) {
        if let Some(count) = self.assigned_counts.get_mut(&agent.id) {
            *count = count.saturating_sub(1);
        }
        if let Some(zone) = agent.zone(&self.zone_attribute)
            && let Some(count) = self.zone_assigned_counts.get_mut(zone)
        {
            *count = count.saturating_sub(1);
        }
    }
}

/// Binary admit/reject check against one agent.
///
/// Implementations are pluggable; an `Err` from `evaluate` is caught and
/// logged by the composite evaluator and treated as a rejection, so one
/// broken constraint leaves its task queued instead of taking down the
/// iteration.
pub trait HardConstraint: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before each iteration (global constraints refresh any
    /// cached fleet state here).
    fn prepare(&self) {}

    fn evaluate(
        &self,
        task: &Task,
        agent: &AgentState,
        ctx: &EvaluationContext,
    ) -> anyhow::Result<Decision>;
}

/// Fitness preference in `[0, 1]`; higher is better.
///
/// An `Err` from `score` is caught and logged by the composite evaluator
/// and contributes a zero score.
pub trait SoftConstraint: Send + Sync {
    fn name(&self) -> &str;

    fn score(
        &self,
        task: &Task,
        agent: &AgentState,
        ctx: &EvaluationContext,
    ) -> anyhow::Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_assignments() {
        let mut ctx = EvaluationContext::new(0, "active", "zone");
        let agent = AgentState::new("a1", "host-1").with_attribute("zone", "z1");

        assert_eq!(ctx.assigned_on("a1"), 0);
        ctx.record_assignment(&agent);
        ctx.record_assignment(&agent);
        assert_eq!(ctx.assigned_on("a1"), 2);
        assert_eq!(ctx.assigned_in_zone("z1"), 2);

        ctx.release_assignment(&agent);
        assert_eq!(ctx.assigned_on("a1"), 1);
        assert_eq!(ctx.assigned_in_zone("z1"), 1);
    }
}
