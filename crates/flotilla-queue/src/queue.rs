//! The tiered task queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use flotilla_types::{ResourceSet, Task, Tier, TierSlas, DEFAULT_CAPACITY_GROUP};

use crate::error::{QueueError, QueueResult};

/// Current resource consumption per capacity group, supplied by the caller
/// at drain time (resources of the group's launched tasks).
pub type GroupConsumption = BTreeMap<String, ResourceSet>;

struct QueuedTask {
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct TierBucket {
    /// Capacity group -> FIFO of waiting tasks. BTreeMap keeps the
    /// round-robin order deterministic (group-name tie-break).
    groups: BTreeMap<String, VecDeque<QueuedTask>>,
}

impl TierBucket {
    fn len(&self) -> usize {
        self.groups.values().map(VecDeque::len).sum()
    }
}

struct QueueInner {
    shut_down: bool,
    next_seq: u64,
    tiers: BTreeMap<Tier, TierBucket>,
    slas: TierSlas,
}

/// Multi-tier holding area for tasks awaiting placement.
///
/// `enqueue` and `remove` may be called from any thread; the placement loop
/// is the only caller of `drain_for_iteration`.
pub struct TieredTaskQueue {
    inner: Mutex<QueueInner>,
}

impl TieredTaskQueue {
    pub fn new() -> Self {
        let mut tiers = BTreeMap::new();
        for tier in Tier::ALL {
            tiers.insert(tier, TierBucket::default());
        }
        Self {
            inner: Mutex::new(QueueInner {
                shut_down: false,
                next_seq: 0,
                tiers,
                slas: TierSlas::default(),
            }),
        }
    }

    /// Place a task into its tier's bucket. Fails only after `shutdown`.
    pub fn enqueue(&self, task: Task) -> QueueResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            return Err(QueueError::ShutdownInProgress);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let group = if task.capacity_group.is_empty() {
            DEFAULT_CAPACITY_GROUP.to_string()
        } else {
            task.capacity_group.clone()
        };
        debug!(task_id = %task.id, tier = ?task.tier, %group, "task queued");
        inner
            .tiers
            .entry(task.tier)
            .or_default()
            .groups
            .entry(group)
            .or_default()
            .push_back(QueuedTask { seq, task });
        Ok(())
    }

    /// Idempotent removal; returns whether the task was present.
    pub fn remove(&self, task_id: &str, tier: Tier) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(bucket) = inner.tiers.get_mut(&tier) else {
            return false;
        };
        for fifo in bucket.groups.values_mut() {
            if let Some(pos) = fifo.iter().position(|qt| qt.task.id == task_id) {
                fifo.remove(pos);
                return true;
            }
        }
        false
    }

    /// Atomically replace the per-tier SLA table. The next iteration's
    /// drain uses the new SLAs.
    pub fn set_sla(&self, slas: TierSlas) {
        let mut inner = self.inner.lock().unwrap();
        inner.slas = slas;
    }

    /// Number of tasks waiting in a tier.
    pub fn len(&self, tier: Tier) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.tiers.get(&tier).map_or(0, TierBucket::len)
    }

    pub fn is_empty(&self) -> bool {
        Tier::ALL.iter().all(|t| self.len(*t) == 0)
    }

    /// Stop accepting tasks. Already-queued tasks stay drainable.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shut_down = true;
    }

    /// Produce the iteration's ordered task snapshot.
    ///
    /// `consumption` is the current per-group usage (launched tasks). The
    /// drain works on a copy of it, charging each yielded task's request,
    /// so the ordering is deterministic and self-limiting: a round-robin
    /// pass over groups still below their guaranteed slice, then over
    /// groups still below `max × (1 + buffer)`. Groups without an SLA have
    /// no guarantee and no limit, so they join the second phase only.
    /// Tasks are not removed; the caller removes the ones it launches.
    pub fn drain_for_iteration(&self, consumption: &GroupConsumption) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut ordered = Vec::new();

        for (tier, bucket) in &inner.tiers {
            let mut working: GroupConsumption = consumption.clone();
            // Per-group cursor into the FIFO.
            let mut cursors: BTreeMap<&str, usize> = BTreeMap::new();

            // Phase 1: groups below guaranteed. Phase 2: below the
            // admission limit (SLA-less groups are unlimited here).
            for guaranteed_phase in [true, false] {
                loop {
                    let mut yielded_any = false;
                    for (group, fifo) in &bucket.groups {
                        let cursor = cursors.entry(group.as_str()).or_insert(0);
                        if *cursor >= fifo.len() {
                            continue;
                        }
                        let used = working.entry(group.clone()).or_default().clone();
                        let eligible = match inner.slas.group(*tier, group) {
                            Some(sla) => {
                                if guaranteed_phase {
                                    sla.below_guaranteed(&used)
                                } else {
                                    sla.below_limit(&used)
                                }
                            }
                            None => !guaranteed_phase,
                        };
                        if !eligible {
                            continue;
                        }
                        let qt = &fifo[*cursor];
                        *cursor += 1;
                        working.insert(group.clone(), used.add(&qt.task.resources));
                        ordered.push(qt.task.clone());
                        yielded_any = true;
                    }
                    if !yielded_any {
                        break;
                    }
                }
            }
        }

        ordered
    }
}

impl Default for TieredTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
