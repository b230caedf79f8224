//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during placement operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("too many concurrent task-failure callback registrations")]
    CapacityExceeded,

    #[error("fatal scheduler error: {0}")]
    Fatal(String),

    #[error(transparent)]
    InvalidInput(#[from] flotilla_types::InvalidInput),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
