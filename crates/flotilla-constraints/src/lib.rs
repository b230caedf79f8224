//! flotilla-constraints — admission and fitness evaluation.
//!
//! The placement engine is polymorphic over two capability sets:
//!
//! - [`HardConstraint`]: binary admit/reject with a reason
//! - [`SoftConstraint`]: fitness score in `[0, 1]`, higher is better
//!
//! A fleet-global hard and soft constraint always apply first; per-task
//! constraints are AND-composed (hard) and weight-averaged (soft). A
//! `fitness_good_enough` threshold lets the engine stop scanning agents
//! once a candidate is good enough.
//!
//! Constraints are a pluggable surface, so evaluation is fallible: the
//! composite evaluator catches and logs an `Err`, treating it as a
//! rejection (hard) or a zero score (soft). A broken constraint leaves
//! its task queued; it never aborts the iteration.

pub mod builtins;
pub mod composite;
pub mod constraint;

pub use builtins::{
    ActiveAgentConstraint, AttributeEqualsConstraint, BinPackingFitness,
    ConsumablePoolsConstraint, ZoneSpreadFitness,
};
pub use composite::{tie_break, CompositeEvaluator, ConstraintRegistry};
pub use constraint::{Decision, EvaluationContext, HardConstraint, SoftConstraint};
