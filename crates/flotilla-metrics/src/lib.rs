//! flotilla-metrics — counter, timer, and gauge handles.
//!
//! Components acquire handles from a [`MetricsRegistry`] at construction
//! time; there is no process-wide registry singleton. The default
//! [`AtomicRegistry`] is lock-free (atomics with relaxed ordering), and
//! [`RecordingRegistry`] lets tests assert on what a component published.

pub mod registry;

pub use registry::{
    AtomicRegistry, Counter, Gauge, MetricsRegistry, RecordingRegistry, Timer,
};
