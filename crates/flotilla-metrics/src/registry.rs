//! Metric handle types and the registries that mint them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A monotonically increasing counter.
#[derive(Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A last-observation gauge.
#[derive(Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicU64>,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct TimerInner {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

/// Records durations in milliseconds.
#[derive(Clone, Default)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub fn record(&self, duration: Duration) {
        self.record_ms(duration.as_millis() as u64);
    }

    pub fn record_ms(&self, ms: u64) {
        self.inner.count.fetch_add(1, Ordering::Relaxed);
        self.inner.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.inner.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    pub fn total_ms(&self) -> u64 {
        self.inner.total_ms.load(Ordering::Relaxed)
    }

    pub fn max_ms(&self) -> u64 {
        self.inner.max_ms.load(Ordering::Relaxed)
    }
}

/// Mints metric handles by name. Handles minted twice for the same name
/// share state.
pub trait MetricsRegistry: Send + Sync {
    fn counter(&self, name: &str) -> Counter;
    fn gauge(&self, name: &str) -> Gauge;
    fn timer(&self, name: &str) -> Timer;
}

#[derive(Default)]
struct Handles {
    counters: HashMap<String, Counter>,
    gauges: HashMap<String, Gauge>,
    timers: HashMap<String, Timer>,
}

/// The default registry: atomics behind a name map.
#[derive(Default)]
pub struct AtomicRegistry {
    handles: Mutex<Handles>,
}

impl AtomicRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsRegistry for AtomicRegistry {
    fn counter(&self, name: &str) -> Counter {
        let mut handles = self.handles.lock().unwrap();
        handles.counters.entry(name.to_string()).or_default().clone()
    }

    fn gauge(&self, name: &str) -> Gauge {
        let mut handles = self.handles.lock().unwrap();
        handles.gauges.entry(name.to_string()).or_default().clone()
    }

    fn timer(&self, name: &str) -> Timer {
        let mut handles = self.handles.lock().unwrap();
        handles.timers.entry(name.to_string()).or_default().clone()
    }
}

/// Test registry with read-back by name.
#[derive(Default)]
pub struct RecordingRegistry {
    inner: AtomicRegistry,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.inner.counter(name).value()
    }

    pub fn gauge_value(&self, name: &str) -> u64 {
        self.inner.gauge(name).value()
    }

    pub fn timer_count(&self, name: &str) -> u64 {
        self.inner.timer(name).count()
    }
}

impl MetricsRegistry for RecordingRegistry {
    fn counter(&self, name: &str) -> Counter {
        self.inner.counter(name)
    }

    fn gauge(&self, name: &str) -> Gauge {
        self.inner.gauge(name)
    }

    fn timer(&self, name: &str) -> Timer {
        self.inner.timer(name)
    }
}
