//! Entity holder trees.
//!
//! An [`EntityHolder`] is an immutable tree node: an identifier, an opaque
//! entity payload, an ordered list of children, and a tag map for
//! side-channel attributes such as retry state. All updates are
//! functional — they return a new tree — which keeps atomic group
//! application and rollback trivial (snapshot = clone).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Retry pacing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    Immediate,
    Fixed { delay_ms: u64 },
    ExponentialBackoff { initial_ms: u64, max_ms: u64 },
}

/// Per-item retry state, stored as a tag on the root holder keyed by the
/// originating task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retryer {
    pub attempts: u32,
    pub next_delay_ms: u64,
    /// Epoch millis before which the item must not be retried.
    pub not_before_ms: u64,
    pub policy: RetryPolicy,
}

impl Retryer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempts: 0,
            next_delay_ms: 0,
            not_before_ms: 0,
            policy,
        }
    }

    /// Record a failed attempt at `now_ms`, advancing the backoff.
    pub fn record_failure(&self, now_ms: u64) -> Self {
        let next_delay_ms = match &self.policy {
            RetryPolicy::Immediate => 0,
            RetryPolicy::Fixed { delay_ms } => *delay_ms,
            RetryPolicy::ExponentialBackoff { initial_ms, max_ms } => {
                if self.attempts == 0 {
                    *initial_ms
                } else {
                    (self.next_delay_ms * 2).min(*max_ms)
                }
            }
        };
        Self {
            attempts: self.attempts + 1,
            next_delay_ms,
            not_before_ms: now_ms + next_delay_ms,
            policy: self.policy.clone(),
        }
    }

    /// Whether a retry may run at `now_ms`.
    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.not_before_ms
    }
}

/// Value stored in a holder's tag map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagValue {
    Int(i64),
    Text(String),
    Retry(Retryer),
}

/// A node in one of the three model trees. Root holders map 1:1 to a root
/// entity (a job); children are its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityHolder<E> {
    id: String,
    entity: E,
    children: Vec<EntityHolder<E>>,
    tags: BTreeMap<String, TagValue>,
}

impl<E: Clone> EntityHolder<E> {
    pub fn new(id: impl Into<String>, entity: E) -> Self {
        Self {
            id: id.into(),
            entity,
            children: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn children(&self) -> &[EntityHolder<E>] {
        &self.children
    }

    pub fn child(&self, id: &str) -> Option<&EntityHolder<E>> {
        self.children.iter().find(|c| c.id == id)
    }

    pub fn has_child(&self, id: &str) -> bool {
        self.child(id).is_some()
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    pub fn tags(&self) -> &BTreeMap<String, TagValue> {
        &self.tags
    }

    /// Replace the root entity payload.
    pub fn with_entity(mut self, entity: E) -> Self {
        self.entity = entity;
        self
    }

    /// Add a child, replacing a same-id child in place (preserving its
    /// position) so the operation is idempotent.
    pub fn with_child(mut self, child: EntityHolder<E>) -> Self {
        match self.children.iter().position(|c| c.id == child.id) {
            Some(pos) => self.children[pos] = child,
            None => self.children.push(child),
        }
        self
    }

    /// Remove a child by id; absent ids are a no-op.
    pub fn without_child(mut self, id: &str) -> Self {
        self.children.retain(|c| c.id != id);
        self
    }

    /// Replace the entity of the child with the given id.
    pub fn with_child_entity(mut self, id: &str, entity: E) -> Option<Self> {
        let pos = self.children.iter().position(|c| c.id == id)?;
        self.children[pos].entity = entity;
        Some(self)
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: TagValue) -> Self {
        self.tags.insert(key.into(), value);
        self
    }

    pub fn without_tag(mut self, key: &str) -> Self {
        self.tags.remove(key);
        self
    }
}
