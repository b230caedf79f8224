//! The offer pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use flotilla_types::{AgentId, AgentState, Offer, OfferId, ResourceSet, TaskId};

/// Why an offer was handed back to the offer source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Past its expiry, or older than the pool-wide lease expiry.
    Expired,
    /// The source rescinded it.
    Rescinded,
    /// The agent is no longer active.
    AgentInactive,
}

/// Callback invoked for every rejected offer. Never called while the pool
/// lock is held.
pub type RejectSink = Arc<dyn Fn(Offer, RejectReason) + Send + Sync>;

struct AgentEntry {
    hostname: String,
    attributes: BTreeMap<String, String>,
    offers: HashMap<OfferId, Offer>,
    /// Tasks currently placed on the agent, with their resource requests.
    running: BTreeMap<TaskId, ResourceSet>,
    /// Epoch millis until which the agent is excluded from placement.
    disabled_until_ms: u64,
}

/// One agent's view for a placement iteration.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent: AgentState,
    /// The live offers backing `agent.available`, oldest first.
    pub offer_ids: Vec<OfferId>,
}

impl AgentSnapshot {
    pub fn is_placeable(&self, now_ms: u64) -> bool {
        self.agent.is_enabled(now_ms) && !self.offer_ids.is_empty()
    }
}

/// Tracks the set of live offers per agent.
///
/// All mutators may be called from any thread; rejection callbacks run
/// after the internal lock is released.
pub struct OfferPool {
    inner: Mutex<HashMap<AgentId, AgentEntry>>,
    reject_sink: RejectSink,
}

impl OfferPool {
    pub fn new(reject_sink: RejectSink) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            reject_sink,
        }
    }

    /// Insert an offer. The agent entry is created on its first offer; a
    /// same-id offer replaces the previous one. Offers for disabled agents
    /// are held but excluded from placement until the window passes.
    pub fn add_offer(&self, offer: Offer) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entry(offer.agent_id.clone())
            .or_insert_with(|| AgentEntry {
                hostname: offer.hostname.clone(),
                attributes: offer.attributes.clone(),
                offers: HashMap::new(),
                running: BTreeMap::new(),
                disabled_until_ms: 0,
            });
        // Offers carry the freshest attribute snapshot.
        entry.attributes = offer.attributes.clone();
        debug!(offer_id = %offer.id, agent = %offer.agent_id, "offer added");
        entry.offers.insert(offer.id.clone(), offer);
    }

    /// Remove an offer and hand it back to the source. Returns whether it
    /// was present.
    pub fn reject_offer(&self, offer_id: &str, reason: RejectReason) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .values_mut()
                .find_map(|entry| entry.offers.remove(offer_id))
        };
        match removed {
            Some(offer) => {
                (self.reject_sink)(offer, reason);
                true
            }
            None => false,
        }
    }

    /// Remove accepted offers without rejecting them back to the source.
    pub fn consume_offers(&self, offer_ids: &[OfferId]) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.values_mut() {
            for id in offer_ids {
                entry.offers.remove(id);
            }
        }
    }

    /// Reject every offer past its own expiry or older than
    /// `lease_expiry_secs`. Returns the number evicted.
    pub fn evict_expired(&self, now_ms: u64, lease_expiry_secs: u64) -> usize {
        let lease_expiry_ms = lease_expiry_secs * 1000;
        let stale: Vec<Offer> = {
            let mut inner = self.inner.lock().unwrap();
            let mut stale = Vec::new();
            for entry in inner.values_mut() {
                let ids: Vec<OfferId> = entry
                    .offers
                    .values()
                    .filter(|o| o.is_stale(now_ms, lease_expiry_ms))
                    .map(|o| o.id.clone())
                    .collect();
                for id in ids {
                    if let Some(offer) = entry.offers.remove(&id) {
                        stale.push(offer);
                    }
                }
            }
            stale
        };
        let evicted = stale.len();
        for offer in stale {
            info!(
                offer_id = %offer.id,
                agent = %offer.agent_id,
                age_secs = offer.age_secs(now_ms),
                "rejecting stale offer"
            );
            (self.reject_sink)(offer, RejectReason::Expired);
        }
        evicted
    }

    /// Bulk-reject every offer held for one agent.
    pub fn expire_all_for(&self, agent_id: &str, reason: RejectReason) -> usize {
        let drained: Vec<Offer> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .get_mut(agent_id)
                .map(|entry| entry.offers.drain().map(|(_, o)| o).collect())
                .unwrap_or_default()
        };
        let count = drained.len();
        for offer in drained {
            (self.reject_sink)(offer, reason);
        }
        count
    }

    /// Bulk-reject every offer in the pool (rescind sentinel `"ALL"`).
    pub fn expire_all(&self, reason: RejectReason) -> usize {
        let drained: Vec<Offer> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .values_mut()
                .flat_map(|entry| entry.offers.drain().map(|(_, o)| o))
                .collect()
        };
        let count = drained.len();
        for offer in drained {
            (self.reject_sink)(offer, reason);
        }
        count
    }

    /// Mark an agent healthy again.
    pub fn enable(&self, agent_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(agent_id) {
            entry.disabled_until_ms = 0;
            info!(agent = %agent_id, "agent enabled");
        }
    }

    /// Exclude an agent from placement for `duration_ms`. Its offers are
    /// held (and still expire normally) but are not considered.
    pub fn disable(&self, agent_id: &str, duration_ms: u64, now_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(agent_id) {
            entry.disabled_until_ms = now_ms + duration_ms;
            info!(agent = %agent_id, duration_ms, "agent disabled");
        }
    }

    /// Record that a task was launched on an agent.
    pub fn task_launched(&self, agent_id: &str, task_id: TaskId, resources: ResourceSet) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(agent_id) {
            entry.running.insert(task_id, resources);
        }
    }

    /// Record that a task left an agent. Returns whether it was tracked.
    pub fn task_finished(&self, agent_id: &str, task_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner
            .get_mut(agent_id)
            .is_some_and(|entry| entry.running.remove(task_id).is_some())
    }

    /// Drop an agent with no offers and no running tasks. Returns whether
    /// it was removed.
    pub fn remove_agent(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(agent_id) {
            Some(entry) if entry.offers.is_empty() && entry.running.is_empty() => {
                inner.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    /// Resources advertised by one live offer.
    pub fn offer_resources(&self, offer_id: &str) -> Option<ResourceSet> {
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .find_map(|entry| entry.offers.get(offer_id).map(|o| o.resources.clone()))
    }

    /// A consistent per-agent view for the iteration. Disabled agents are
    /// included (the caller filters with [`AgentSnapshot::is_placeable`])
    /// so usage metrics still see them.
    pub fn snapshot(&self, now_ms: u64) -> Vec<AgentSnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut snapshots: Vec<AgentSnapshot> = inner
            .iter()
            .map(|(agent_id, entry)| {
                let mut live: Vec<&Offer> = entry
                    .offers
                    .values()
                    .filter(|o| now_ms < o.expires_at_ms)
                    .collect();
                live.sort_by_key(|o| (o.offered_at_ms, o.id.clone()));

                let available = live
                    .iter()
                    .fold(ResourceSet::zero(), |acc, o| acc.add(&o.resources));
                let consumed = entry
                    .running
                    .values()
                    .fold(ResourceSet::zero(), |acc, r| acc.add(r));

                let mut agent = AgentState::new(agent_id.clone(), entry.hostname.clone());
                agent.attributes = entry.attributes.clone();
                agent.total = available.add(&consumed);
                agent.available = available;
                agent.running_tasks = entry.running.keys().cloned().collect();
                agent.disabled_until_ms = entry.disabled_until_ms;

                AgentSnapshot {
                    agent,
                    offer_ids: live.iter().map(|o| o.id.clone()).collect(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.agent.id.cmp(&b.agent.id));
        snapshots
    }
}
