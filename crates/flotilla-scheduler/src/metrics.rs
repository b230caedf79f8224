//! Metric handles published by the placement engine.

use flotilla_metrics::{Counter, Gauge, MetricsRegistry, Timer};

const PREFIX: &str = "scheduler.";

/// All handles are acquired once at engine construction.
pub struct SchedulerMetrics {
    pub offers_received: Counter,
    pub offers_rejected: Counter,
    pub workers_launched: Counter,
    pub autoscale_up_actions: Counter,
    pub autoscale_down_actions: Counter,
    pub task_failure_requests: Counter,
    pub task_failure_requests_rejected: Counter,
    pub iteration_run_ms: Timer,

    pub active_agents: Gauge,
    pub disabled_agents: Gauge,
    pub min_disable_duration_ms: Gauge,
    pub max_disable_duration_ms: Gauge,
    pub total_available_cpus: Gauge,
    pub total_allocated_cpus: Gauge,
    pub total_available_memory_mb: Gauge,
    pub total_allocated_memory_mb: Gauge,
    pub total_available_network_mbps: Gauge,
    pub total_allocated_network_mbps: Gauge,
    pub cpu_utilization: Gauge,
    pub memory_utilization: Gauge,
    pub network_utilization: Gauge,
    pub dominant_resource_utilization: Gauge,
    pub pending_workers: Gauge,
    pub queued_critical: Gauge,
    pub queued_flex: Gauge,
}

impl SchedulerMetrics {
    pub fn new(registry: &dyn MetricsRegistry) -> Self {
        let counter = |name: &str| registry.counter(&format!("{PREFIX}{name}"));
        let gauge = |name: &str| registry.gauge(&format!("{PREFIX}{name}"));
        Self {
            offers_received: counter("offersReceived"),
            offers_rejected: counter("offersRejected"),
            workers_launched: counter("workersLaunched"),
            autoscale_up_actions: counter("autoScaleUpActions"),
            autoscale_down_actions: counter("autoScaleDownActions"),
            task_failure_requests: counter("taskFailureRequests"),
            task_failure_requests_rejected: counter("taskFailureRequestsLimitReached"),
            iteration_run_ms: registry.timer(&format!("{PREFIX}iterationRunMs")),

            active_agents: gauge("activeAgents"),
            disabled_agents: gauge("disabledAgents"),
            min_disable_duration_ms: gauge("minDisableDurationMs"),
            max_disable_duration_ms: gauge("maxDisableDurationMs"),
            total_available_cpus: gauge("availableCpus"),
            total_allocated_cpus: gauge("allocatedCpus"),
            total_available_memory_mb: gauge("availableMemoryMb"),
            total_allocated_memory_mb: gauge("allocatedMemoryMb"),
            total_available_network_mbps: gauge("availableNetworkMbps"),
            total_allocated_network_mbps: gauge("allocatedNetworkMbps"),
            cpu_utilization: gauge("cpuUtilization"),
            memory_utilization: gauge("memoryUtilization"),
            network_utilization: gauge("networkUtilization"),
            dominant_resource_utilization: gauge("dominantResourceUtilization"),
            pending_workers: gauge("pendingWorkers"),
            queued_critical: gauge("queuedCritical"),
            queued_flex: gauge("queuedFlex"),
        }
    }
}
