//! Resource offers (leases) from worker agents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::resources::ResourceSet;

/// Unique offer identifier, assigned by the offer source.
pub type OfferId = String;

/// A time-bounded advertisement of available resources on one agent.
///
/// Offers are ephemeral: accepting one consumes it (possibly against several
/// tasks in the same iteration), and unaccepted offers are rejected back to
/// the source before they expire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: ResourceSet,
    /// Snapshot of the agent's attributes at offer time.
    pub attributes: BTreeMap<String, String>,
    pub offered_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Offer {
    /// Whether the offer has passed its own expiry, or is older than the
    /// pool-wide lease expiry.
    pub fn is_stale(&self, now_ms: u64, lease_expiry_ms: u64) -> bool {
        now_ms >= self.expires_at_ms || now_ms.saturating_sub(self.offered_at_ms) >= lease_expiry_ms
    }

    /// Offer age, for rejection logging.
    pub fn age_secs(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.offered_at_ms) / 1000
    }
}
