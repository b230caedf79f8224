//! Capacity-group SLAs and the per-tier SLA table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::InvalidInput;
use crate::resources::ResourceSet;
use crate::task::Tier;

/// Capacity group used for tasks that do not name one.
pub const DEFAULT_CAPACITY_GROUP: &str = "default";

/// SLA for one capacity group within a tier.
///
/// The group is guaranteed its `guaranteed` slice; it may consume up to
/// `max × (1 + buffer)` before the queue stops admitting its tasks. The
/// same limit governs both admission and consumption comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityGroupSla {
    pub name: String,
    pub tier: Tier,
    pub guaranteed: ResourceSet,
    pub max: ResourceSet,
    pub buffer: f64,
}

impl CapacityGroupSla {
    pub fn new(
        name: impl Into<String>,
        tier: Tier,
        guaranteed: ResourceSet,
        max: ResourceSet,
        buffer: f64,
    ) -> Result<Self, InvalidInput> {
        if buffer < 0.0 {
            return Err(InvalidInput::new("buffer", format!("must be >= 0, got {buffer}")));
        }
        Ok(Self {
            name: name.into(),
            tier,
            guaranteed,
            max,
            buffer,
        })
    }

    /// The hard ceiling for this group: `max × (1 + buffer)`.
    pub fn admission_limit(&self) -> ResourceSet {
        self.max.scaled(1.0 + self.buffer)
    }

    /// True when `consumption` has not yet reached the guaranteed share on
    /// any dimension.
    pub fn below_guaranteed(&self, consumption: &ResourceSet) -> bool {
        !consumption.any_dimension_at_or_above(&self.guaranteed)
    }

    /// True when `consumption` is still under the admission limit.
    pub fn below_limit(&self, consumption: &ResourceSet) -> bool {
        !consumption.any_dimension_at_or_above(&self.admission_limit())
    }
}

/// The per-tier SLA table, atomically replaceable on the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierSlas {
    groups: BTreeMap<Tier, BTreeMap<String, CapacityGroupSla>>,
}

impl TierSlas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, sla: CapacityGroupSla) -> Self {
        self.insert(sla);
        self
    }

    pub fn insert(&mut self, sla: CapacityGroupSla) {
        self.groups
            .entry(sla.tier)
            .or_default()
            .insert(sla.name.clone(), sla);
    }

    pub fn group(&self, tier: Tier, name: &str) -> Option<&CapacityGroupSla> {
        self.groups.get(&tier).and_then(|m| m.get(name))
    }

    pub fn groups_in_tier(&self, tier: Tier) -> impl Iterator<Item = &CapacityGroupSla> {
        self.groups.get(&tier).into_iter().flat_map(|m| m.values())
    }
}
