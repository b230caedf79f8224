//! Configuration for the placement and reconciliation loops.
//!
//! Both structs deserialize from TOML with per-field defaults, and validate
//! invariants at construction time rather than deep inside the loops.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::InvalidInput;

/// Placement-engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum delay between placement iterations.
    pub scheduler_iteration_interval_ms: u64,
    /// Rate limit when no assignments were possible and no new offers
    /// arrived.
    pub max_delay_ms_between_iterations: u64,
    /// Offers older than this are rejected before the iteration starts.
    pub lease_offer_expiry_secs: u64,
    /// Maximum pending placement-failure callback registrations.
    pub task_failures_queue_capacity: usize,
    /// Composite fitness at or above which candidate scanning stops early.
    pub fitness_good_enough: f64,
    /// Allow several tasks to consume one offer within an iteration.
    pub multi_task_per_offer: bool,
    /// Terminate the process (exit code 3) on a fatal scheduling error.
    pub exit_on_scheduling_error_enabled: bool,
    /// Use the optimizing estimator for unmet-demand computation.
    pub optimizing_shortfall_evaluator_enabled: bool,
    /// Agent attribute naming the autoscalable instance group.
    pub autoscale_by_attribute_name: String,
    /// Agent attribute distinguishing active agents from drain-only ones.
    pub active_agent_attribute_name: String,
    /// Agent attribute naming the availability zone.
    pub zone_attribute_name: String,
    /// Hysteresis before acting on a scale-up signal.
    pub delay_autoscale_up_by_secs: u64,
    /// Hysteresis before acting on a scale-down signal.
    pub delay_autoscale_down_by_secs: u64,
    /// An agent with at least this much free cpu counts as idle when its
    /// group has no rule-specific threshold.
    pub idle_machine_cpu_threshold: f64,
    /// Companion memory threshold for idle classification.
    pub idle_machine_memory_mb_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_iteration_interval_ms: 100,
            max_delay_ms_between_iterations: 5_000,
            lease_offer_expiry_secs: 300,
            task_failures_queue_capacity: 5,
            fitness_good_enough: 0.9,
            multi_task_per_offer: false,
            exit_on_scheduling_error_enabled: false,
            optimizing_shortfall_evaluator_enabled: false,
            autoscale_by_attribute_name: "asg".to_string(),
            active_agent_attribute_name: "active".to_string(),
            zone_attribute_name: "zone".to_string(),
            delay_autoscale_up_by_secs: 30,
            delay_autoscale_down_by_secs: 300,
            idle_machine_cpu_threshold: 8.0,
            idle_machine_memory_mb_threshold: 10 * 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> Result<Self, InvalidInput> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InvalidInput::new("config", format!("read {path:?}: {e}")))?;
        let config: SchedulerConfig = toml::from_str(&content)
            .map_err(|e| InvalidInput::new("config", format!("parse {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), InvalidInput> {
        if self.scheduler_iteration_interval_ms == 0 {
            return Err(InvalidInput::new(
                "scheduler_iteration_interval_ms",
                "must be > 0",
            ));
        }
        if self.max_delay_ms_between_iterations < self.scheduler_iteration_interval_ms {
            return Err(InvalidInput::new(
                "max_delay_ms_between_iterations",
                "must be >= scheduler_iteration_interval_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.fitness_good_enough) {
            return Err(InvalidInput::new(
                "fitness_good_enough",
                format!("must be within [0, 1], got {}", self.fitness_good_enough),
            ));
        }
        if self.task_failures_queue_capacity == 0 {
            return Err(InvalidInput::new("task_failures_queue_capacity", "must be > 0"));
        }
        Ok(())
    }
}

/// Reconciliation-framework configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Loop delay while any engine has pending change actions.
    pub active_timeout_ms: u64,
    /// Loop delay when all engines are quiescent.
    pub idle_timeout_ms: u64,
    /// Maximum wait for a store write acknowledgment.
    pub store_update_timeout_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            active_timeout_ms: 50,
            idle_timeout_ms: 1_000,
            store_update_timeout_ms: 5_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_file(path: &Path) -> Result<Self, InvalidInput> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InvalidInput::new("config", format!("read {path:?}: {e}")))?;
        let config: ReconcilerConfig = toml::from_str(&content)
            .map_err(|e| InvalidInput::new("config", format!("parse {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Requires `0 < active_timeout_ms <= idle_timeout_ms`.
    pub fn validate(&self) -> Result<(), InvalidInput> {
        if self.active_timeout_ms == 0 {
            return Err(InvalidInput::new("active_timeout_ms", "must be > 0"));
        }
        if self.active_timeout_ms > self.idle_timeout_ms {
            return Err(InvalidInput::new(
                "active_timeout_ms",
                format!(
                    "active_timeout_ms ({}) must be <= idle_timeout_ms ({})",
                    self.active_timeout_ms, self.idle_timeout_ms
                ),
            ));
        }
        Ok(())
    }
}
