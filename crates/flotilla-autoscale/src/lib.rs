//! flotilla-autoscale — cluster scaling decisions.
//!
//! The [`AutoscaleController`] watches per-instance-group views produced
//! after every placement iteration (idle agents, unmet resource shortfall)
//! and emits abstract [`ScaleAction`]s. Executing them belongs to an
//! external [`ClusterManager`]; instances it declines to terminate are
//! reported back so the scheduler can re-enable them.

pub mod controller;
pub mod evaluators;

pub use controller::{
    AutoscaleController, ClusterManager, GroupView, IdleAgent, InstanceGroupEvent, ScaleAction,
    ScaleDownOutcome,
};
pub use evaluators::{
    LongestIdleFirst, NaiveShortfallEvaluator, OptimizingShortfallEvaluator,
    ScaleDownConstraintEvaluator, ScaleDownOrderEvaluator, ShortfallEvaluator,
};
