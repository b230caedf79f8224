//! External collaborator interfaces consumed by the placement engine.

use flotilla_types::{AgentId, OfferId, TaskId};

use crate::plan::TaskPlacement;

/// Launches accepted assignments on the cluster.
///
/// The handler may reject individual assignments (a task cancelled
/// mid-iteration); it returns the ids of tasks it did NOT launch. Rejected
/// assignments release their working resources, and their offers are left
/// to expire normally.
pub trait LaunchHandler: Send + Sync {
    fn launch_tasks(&self, placements: &[TaskPlacement]) -> anyhow::Result<Vec<TaskId>>;
}

/// Receives the running tasks of agents that left the active set, so they
/// can be replaced elsewhere.
pub trait TaskMigrator: Send + Sync {
    fn migrate(&self, tasks: Vec<TaskId>);
}

/// Per-instance health report from the agent status monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    pub health: AgentHealth,
    /// How long to exclude an unhealthy agent from placement.
    pub disable_ms: Option<u64>,
}

/// A rescind notice from the offer source. The source may name one offer,
/// a whole agent, or everything (the `"ALL"` sentinel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferRescind {
    Offer(OfferId),
    Agent(AgentId),
    All,
}
