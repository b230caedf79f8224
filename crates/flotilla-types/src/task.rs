//! Tasks, tiers, and the task lifecycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceSet;

/// Globally unique task identifier.
pub type TaskId = String;

/// Identifier of the job that owns a task.
pub type JobId = String;

/// Priority band. `Critical` is scheduled before `Flex` and autoscaled more
/// aggressively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Critical,
    Flex,
}

impl Tier {
    /// Tiers in scheduling order.
    pub const ALL: [Tier; 2] = [Tier::Critical, Tier::Flex];
}

/// Task lifecycle state.
///
/// A task is created `Accepted` by the job subsystem, becomes `Queued` when
/// it enters the placement queue, `Launched` once an assignment is persisted,
/// and moves through the start states as the agent reports progress. A kill
/// can interrupt any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Accepted,
    Queued,
    Launched,
    StartInitiated,
    Started,
    KillInitiated,
    Finished,
}

impl TaskState {
    /// Whether the normal lifecycle (or a kill) permits moving to `next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Accepted, Queued)
            | (Queued, Launched)
            | (Launched, StartInitiated)
            | (StartInitiated, Started) => true,
            // A kill may interrupt any live state; finish follows a kill or
            // a normal run.
            (Accepted | Queued | Launched | StartInitiated | Started, KillInitiated) => true,
            (Started | KillInitiated, Finished) => true,
            _ => false,
        }
    }

    /// Terminal states never leave the store.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished)
    }
}

/// Reference to a named soft constraint with its weight in the composite
/// score. Weights are non-negative; the evaluator normalizes by their sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftConstraintRef {
    pub name: String,
    pub weight: f64,
}

/// A single schedulable unit of work.
///
/// Created by the job subsystem at submission, mutated only by its owning
/// reconciliation engine, removed once `Finished` is acknowledged by the
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub resources: ResourceSet,
    pub tier: Tier,
    pub capacity_group: String,
    #[serde(default)]
    pub hard_constraints: Vec<String>,
    #[serde(default)]
    pub soft_constraints: Vec<SoftConstraintRef>,
    pub state: TaskState,
    /// Free-form placement context (agent host, zone, kill reason).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl Task {
    /// A fresh task in the `Accepted` state.
    pub fn new(
        id: impl Into<TaskId>,
        job_id: impl Into<JobId>,
        resources: ResourceSet,
        tier: Tier,
        capacity_group: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            resources,
            tier,
            capacity_group: capacity_group.into(),
            hard_constraints: Vec::new(),
            soft_constraints: Vec::new(),
            state: TaskState::Accepted,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    pub fn with_hard_constraint(mut self, name: impl Into<String>) -> Self {
        self.hard_constraints.push(name.into());
        self
    }

    pub fn with_soft_constraint(mut self, name: impl Into<String>, weight: f64) -> Self {
        self.soft_constraints.push(SoftConstraintRef {
            name: name.into(),
            weight,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle_transitions() {
        use TaskState::*;
        assert!(Accepted.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Launched));
        assert!(Launched.can_transition_to(StartInitiated));
        assert!(StartInitiated.can_transition_to(Started));
        assert!(Started.can_transition_to(Finished));
    }

    #[test]
    fn kill_interrupts_any_live_state() {
        use TaskState::*;
        for state in [Accepted, Queued, Launched, StartInitiated, Started] {
            assert!(state.can_transition_to(KillInitiated), "{state:?}");
        }
        assert!(KillInitiated.can_transition_to(Finished));
    }

    #[test]
    fn no_backwards_transitions() {
        use TaskState::*;
        assert!(!Launched.can_transition_to(Queued));
        assert!(!Finished.can_transition_to(KillInitiated));
        assert!(!Started.can_transition_to(Launched));
    }

    #[test]
    fn tiers_order_critical_first() {
        assert!(Tier::Critical < Tier::Flex);
        assert_eq!(Tier::ALL[0], Tier::Critical);
    }
}
