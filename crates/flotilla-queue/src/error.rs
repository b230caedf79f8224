//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task queue is shut down")]
    ShutdownInProgress,
}

pub type QueueResult<T> = Result<T, QueueError>;
