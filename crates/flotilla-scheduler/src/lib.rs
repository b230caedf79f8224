//! flotilla-scheduler — the placement engine.
//!
//! The [`PlacementEngine`] runs the periodic matching loop:
//!
//! 1. Pre-hook: refresh global constraints and the tier→group map
//! 2. Snapshot the task queue and the offer pool
//! 3. Match tasks to agents through the constraint evaluator, tracking
//!    remaining resources in working copies (offers are never over-committed
//!    within an iteration)
//! 4. Hand assignments to the launch collaborator; rejected assignments
//!    release their resources
//! 5. Feed the post-iteration fleet view to the autoscale controller
//! 6. Deliver registered placement-failure callbacks
//! 7. Publish metrics and sleep until the next tick
//!
//! Unexpected per-task errors leave the task queued; a fatal aggregate
//! error optionally dumps state and terminates the process.

pub mod collaborators;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod plan;

pub use collaborators::{
    AgentHealth, AgentStatus, LaunchHandler, OfferRescind, TaskMigrator,
};
pub use engine::{IterationOutcome, PlacementEngine};
pub use error::{SchedulerError, SchedulerResult};
pub use metrics::SchedulerMetrics;
pub use plan::{plan_iteration, IterationPlan, PlacementFailure, TaskPlacement};
