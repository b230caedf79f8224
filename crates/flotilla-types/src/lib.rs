//! flotilla-types — domain model for the flotilla scheduling core.
//!
//! Defines the shared vocabulary of the placement and reconciliation
//! subsystems:
//!
//! - Multi-dimensional resource amounts ([`ResourceSet`])
//! - Tasks, their lifecycle states, and constraint references
//! - Agents and the time-limited resource offers they advertise
//! - Capacity-group SLAs and instance-group autoscale rules
//! - Validated configuration for both control loops
//!
//! All types are plain data with serde derives; behavior lives in the
//! subsystem crates.

pub mod agent;
pub mod config;
pub mod error;
pub mod instance_group;
pub mod offer;
pub mod resources;
pub mod sla;
pub mod task;

pub use agent::{AgentId, AgentState, FleetUsage};
pub use config::{ReconcilerConfig, SchedulerConfig};
pub use error::InvalidInput;
pub use instance_group::InstanceGroup;
pub use offer::{Offer, OfferId};
pub use resources::ResourceSet;
pub use sla::{CapacityGroupSla, TierSlas, DEFAULT_CAPACITY_GROUP};
pub use task::{JobId, SoftConstraintRef, Task, TaskId, TaskState, Tier};
