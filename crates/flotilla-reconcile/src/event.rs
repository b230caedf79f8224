//! Typed reconciliation events.

use serde::{Deserialize, Serialize};

/// Which of an engine's three models an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Reference,
    Running,
    Store,
}

/// Event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ModelUpdate,
    ChangeStarted,
    ChangeCompleted,
    ChangeFailed,
}

/// One entry in an engine's event stream.
///
/// Events are totally ordered per engine (non-decreasing timestamps);
/// across engines no ordering is guaranteed — subscribers key on
/// `root_id` to recover per-engine order from the merged stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerEvent {
    pub timestamp_ms: u64,
    pub root_id: String,
    pub kind: EventKind,
    pub model: Option<ModelKind>,
    pub summary: String,
    pub error: Option<String>,
}

impl ReconcilerEvent {
    pub fn new(
        timestamp_ms: u64,
        root_id: impl Into<String>,
        kind: EventKind,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            timestamp_ms,
            root_id: root_id.into(),
            kind,
            model: None,
            summary: summary.into(),
            error: None,
        }
    }

    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
