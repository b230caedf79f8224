//! flotilla-store — durable persistence for jobs and tasks.
//!
//! The reconciliation layer talks to storage through the [`JobStore`]
//! trait; [`RedbJobStore`] is the bundled driver, keeping JSON-serialized
//! records in redb tables. An in-memory backend is available for tests.

pub mod error;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::{JobRecord, JobStore, RedbJobStore, StoreFuture};
