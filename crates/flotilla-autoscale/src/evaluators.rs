//! Pluggable evaluators for scale-down ordering and shortfall estimation.

use flotilla_types::AgentId;

use crate::controller::{GroupView, IdleAgent};

/// Orders scale-down candidates; instances earlier in the result are
/// terminated first.
pub trait ScaleDownOrderEvaluator: Send + Sync {
    fn order(&self, candidates: &[IdleAgent]) -> Vec<AgentId>;
}

/// Default ordering: idle the longest first, agent id as tie-break.
pub struct LongestIdleFirst;

impl ScaleDownOrderEvaluator for LongestIdleFirst {
    fn order(&self, candidates: &[IdleAgent]) -> Vec<AgentId> {
        let mut ordered: Vec<&IdleAgent> = candidates.iter().collect();
        ordered.sort_by(|a, b| {
            a.idle_since_ms
                .cmp(&b.idle_since_ms)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        ordered.into_iter().map(|c| c.agent_id.clone()).collect()
    }
}

/// Scores one candidate's suitability for termination in `[0, 1]`.
/// Candidates whose weighted average falls below 0.5 are kept alive.
pub trait ScaleDownConstraintEvaluator: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, agent_id: &str, view: &GroupView) -> f64;
}

/// Estimates the number of instances needed to cover a group's unmet
/// demand.
pub trait ShortfallEvaluator: Send + Sync {
    fn shortfall_slots(&self, view: &GroupView, pending_scale_up: u32) -> u32;
}

/// Straight division of the shortfall by the typical slot, taking the
/// worst dimension.
pub struct NaiveShortfallEvaluator;

impl ShortfallEvaluator for NaiveShortfallEvaluator {
    fn shortfall_slots(&self, view: &GroupView, _pending_scale_up: u32) -> u32 {
        slots_for(view)
    }
}

/// Like the naive estimator, but discounts capacity already requested by
/// in-flight scale-ups so repeated iterations do not double-scale.
pub struct OptimizingShortfallEvaluator;

impl ShortfallEvaluator for OptimizingShortfallEvaluator {
    fn shortfall_slots(&self, view: &GroupView, pending_scale_up: u32) -> u32 {
        slots_for(view).saturating_sub(pending_scale_up)
    }
}

fn slots_for(view: &GroupView) -> u32 {
    let per_dim = [
        ratio(view.shortfall.cpus, view.typical_slot.cpus),
        ratio(view.shortfall.memory_mb as f64, view.typical_slot.memory_mb as f64),
        ratio(
            view.shortfall.network_mbps as f64,
            view.typical_slot.network_mbps as f64,
        ),
        ratio(view.shortfall.gpus as f64, view.typical_slot.gpus as f64),
    ];
    per_dim.into_iter().fold(0, u32::max)
}

fn ratio(needed: f64, slot: f64) -> u32 {
    if needed <= 0.0 || slot <= 0.0 {
        0
    } else {
        (needed / slot).ceil() as u32
    }
}
