//! Store error types.

use thiserror::Error;

/// Errors surfaced by store drivers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("deserialize error: {0}")]
    Deserialize(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store write timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;
