//! Multi-dimensional resource amounts.
//!
//! A [`ResourceSet`] carries the standard dimensions (cpu, memory, disk,
//! network, gpus, ports) plus named scalar consumables. Placement math
//! always runs on working copies, so the operations here are pure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resource amounts along every dimension the scheduler tracks.
///
/// `cpus` is fractional (tasks may request e.g. 0.5 cores); the remaining
/// standard dimensions are integral. Named consumables (gpu pools, IP sets)
/// live in `scalars`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub cpus: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub network_mbps: u64,
    pub gpus: u64,
    pub ports: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scalars: BTreeMap<String, f64>,
}

impl ResourceSet {
    /// The empty amount.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Convenience constructor for the two dimensions almost every test and
    /// SLA cares about.
    pub fn from_cpu_memory(cpus: f64, memory_mb: u64) -> Self {
        Self {
            cpus,
            memory_mb,
            ..Self::default()
        }
    }

    pub fn with_scalar(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.scalars.insert(name.into(), amount);
        self
    }

    /// True when every dimension is zero.
    pub fn is_zero(&self) -> bool {
        self.cpus == 0.0
            && self.memory_mb == 0
            && self.disk_mb == 0
            && self.network_mbps == 0
            && self.gpus == 0
            && self.ports == 0
            && self.scalars.values().all(|v| *v == 0.0)
    }

    /// True when `request` fits inside `self` on every dimension, including
    /// each named scalar the request asks for.
    pub fn fits(&self, request: &ResourceSet) -> bool {
        if request.cpus > self.cpus
            || request.memory_mb > self.memory_mb
            || request.disk_mb > self.disk_mb
            || request.network_mbps > self.network_mbps
            || request.gpus > self.gpus
            || request.ports > self.ports
        {
            return false;
        }
        request
            .scalars
            .iter()
            .all(|(name, amount)| *amount <= self.scalars.get(name).copied().unwrap_or(0.0))
    }

    /// Subtract `request` from `self`, returning `None` if it does not fit.
    pub fn checked_sub(&self, request: &ResourceSet) -> Option<ResourceSet> {
        if !self.fits(request) {
            return None;
        }
        let mut scalars = self.scalars.clone();
        for (name, amount) in &request.scalars {
            if let Some(have) = scalars.get_mut(name) {
                *have -= amount;
            }
        }
        Some(ResourceSet {
            cpus: self.cpus - request.cpus,
            memory_mb: self.memory_mb - request.memory_mb,
            disk_mb: self.disk_mb - request.disk_mb,
            network_mbps: self.network_mbps - request.network_mbps,
            gpus: self.gpus - request.gpus,
            ports: self.ports - request.ports,
            scalars,
        })
    }

    /// Add `other` into `self` (used when a rejected assignment releases its
    /// resources, and for consumption accounting).
    pub fn add(&self, other: &ResourceSet) -> ResourceSet {
        let mut scalars = self.scalars.clone();
        for (name, amount) in &other.scalars {
            *scalars.entry(name.clone()).or_insert(0.0) += amount;
        }
        ResourceSet {
            cpus: self.cpus + other.cpus,
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb.saturating_add(other.disk_mb),
            network_mbps: self.network_mbps.saturating_add(other.network_mbps),
            gpus: self.gpus + other.gpus,
            ports: self.ports + other.ports,
            scalars,
        }
    }

    /// Scale every dimension by `factor` (SLA buffer math).
    pub fn scaled(&self, factor: f64) -> ResourceSet {
        let scale_u64 = |v: u64| (v as f64 * factor).floor() as u64;
        ResourceSet {
            cpus: self.cpus * factor,
            memory_mb: scale_u64(self.memory_mb),
            disk_mb: scale_u64(self.disk_mb),
            network_mbps: scale_u64(self.network_mbps),
            gpus: scale_u64(self.gpus),
            ports: scale_u64(self.ports),
            scalars: self
                .scalars
                .iter()
                .map(|(k, v)| (k.clone(), v * factor))
                .collect(),
        }
    }

    /// True when any dimension of `self` reaches or exceeds the same
    /// dimension of `limit`. Used for capacity-group throttling, where one
    /// saturated dimension caps the group.
    pub fn any_dimension_at_or_above(&self, limit: &ResourceSet) -> bool {
        self.cpus >= limit.cpus && limit.cpus > 0.0
            || self.memory_mb >= limit.memory_mb && limit.memory_mb > 0
            || self.disk_mb >= limit.disk_mb && limit.disk_mb > 0
            || self.network_mbps >= limit.network_mbps && limit.network_mbps > 0
            || self.gpus >= limit.gpus && limit.gpus > 0
            || self.ports >= limit.ports && limit.ports > 0
    }
}
