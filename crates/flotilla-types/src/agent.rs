//! Worker agents and fleet-wide usage accounting.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::resources::ResourceSet;
use crate::task::TaskId;

/// Unique agent (worker host) identifier.
pub type AgentId = String;

/// The scheduler's view of one worker agent.
///
/// Created when the agent's first offer arrives; removed once the agent is
/// inactive and all of its tasks have been migrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub hostname: String,
    /// Agent attributes, including the instance-group and zone tags.
    pub attributes: BTreeMap<String, String>,
    /// Total advertised capacity.
    pub total: ResourceSet,
    /// Resources currently available (live offers minus running tasks).
    pub available: ResourceSet,
    /// Tasks currently placed on this agent.
    pub running_tasks: BTreeSet<TaskId>,
    /// Epoch millis until which the agent is disabled. 0 = enabled.
    pub disabled_until_ms: u64,
}

impl AgentState {
    pub fn new(id: impl Into<AgentId>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            attributes: BTreeMap::new(),
            total: ResourceSet::zero(),
            available: ResourceSet::zero(),
            running_tasks: BTreeSet::new(),
            disabled_until_ms: 0,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// True when the disable window has passed (or was never set).
    pub fn is_enabled(&self, now_ms: u64) -> bool {
        self.disabled_until_ms <= now_ms
    }

    /// The instance group this agent belongs to, per the configured
    /// attribute name.
    pub fn instance_group(&self, attribute_name: &str) -> Option<&str> {
        self.attributes.get(attribute_name).map(String::as_str)
    }

    /// The agent's availability zone, per the configured attribute name.
    pub fn zone(&self, attribute_name: &str) -> Option<&str> {
        self.attributes.get(attribute_name).map(String::as_str)
    }
}

/// Fleet-wide resource usage rollup published as gauges after every
/// placement iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetUsage {
    pub total_cpus: f64,
    pub allocated_cpus: f64,
    pub total_memory_mb: u64,
    pub allocated_memory_mb: u64,
    pub total_network_mbps: u64,
    pub allocated_network_mbps: u64,
    pub disabled_agents: u64,
    pub min_disable_duration_ms: u64,
    pub max_disable_duration_ms: u64,
}

impl FleetUsage {
    pub fn cpu_utilization_pct(&self) -> u64 {
        pct(self.allocated_cpus, self.total_cpus)
    }

    pub fn memory_utilization_pct(&self) -> u64 {
        pct(self.allocated_memory_mb as f64, self.total_memory_mb as f64)
    }

    pub fn network_utilization_pct(&self) -> u64 {
        pct(
            self.allocated_network_mbps as f64,
            self.total_network_mbps as f64,
        )
    }

    /// Highest utilization across the three primary dimensions.
    pub fn dominant_resource_utilization_pct(&self) -> u64 {
        self.cpu_utilization_pct()
            .max(self.memory_utilization_pct())
            .max(self.network_utilization_pct())
    }
}

fn pct(used: f64, total: f64) -> u64 {
    (used * 100.0 / total.max(1.0)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_window() {
        let mut agent = AgentState::new("a1", "host-1");
        assert!(agent.is_enabled(1_000));
        agent.disabled_until_ms = 5_000;
        assert!(!agent.is_enabled(4_999));
        assert!(agent.is_enabled(5_000));
    }

    #[test]
    fn attribute_helpers() {
        let agent = AgentState::new("a1", "host-1")
            .with_attribute("asg", "m5-group")
            .with_attribute("zone", "us-east-1a");
        assert_eq!(agent.instance_group("asg"), Some("m5-group"));
        assert_eq!(agent.zone("zone"), Some("us-east-1a"));
        assert_eq!(agent.instance_group("missing"), None);
    }

    #[test]
    fn dominant_resource_is_the_max() {
        let usage = FleetUsage {
            total_cpus: 100.0,
            allocated_cpus: 10.0,
            total_memory_mb: 1000,
            allocated_memory_mb: 900,
            total_network_mbps: 1000,
            allocated_network_mbps: 500,
            ..FleetUsage::default()
        };
        assert_eq!(usage.dominant_resource_utilization_pct(), 90);
    }
}
