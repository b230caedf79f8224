//! Reconciliation error types.

use thiserror::Error;

use flotilla_store::StoreError;

/// Errors surfaced by engines and the framework.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("reconciliation framework is stopped")]
    ShutdownInProgress,

    #[error("change action cancelled")]
    Cancelled,

    #[error("no engine for root id {0}")]
    EngineNotFound(String),

    #[error("invalid model update: {0}")]
    InvalidUpdate(String),

    #[error("store update timed out after {elapsed_ms}ms")]
    StoreTimeout { elapsed_ms: u64 },

    #[error("store error: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout { elapsed_ms } => ReconcileError::StoreTimeout { elapsed_ms },
            other => ReconcileError::Store(other.to_string()),
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
