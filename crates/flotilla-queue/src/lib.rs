//! flotilla-queue — ordered holding area for tasks awaiting placement.
//!
//! Tasks wait in per-tier, per-capacity-group FIFO buckets. Each placement
//! iteration drains a deterministic snapshot ordered by tier, then
//! capacity-group fair share, then FIFO within a group. Fair share follows
//! the tier's SLA table: groups below their guaranteed slice go first, then
//! groups below `max × (1 + buffer)`; groups at their limit are skipped.

pub mod error;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use queue::{GroupConsumption, TieredTaskQueue};
