//! flotilla-offers — the pool of live resource offers.
//!
//! Tracks currently valid offers per agent, evicts stale ones back to the
//! offer source, and carries per-agent enable/disable windows driven by
//! health monitoring. The placement engine reads a consistent
//! [`AgentSnapshot`] list at the start of every iteration.

pub mod pool;

pub use pool::{AgentSnapshot, OfferPool, RejectReason, RejectSink};
