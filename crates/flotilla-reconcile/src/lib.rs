//! flotilla-reconcile — the three-model reconciliation framework.
//!
//! Every root entity (a job) gets a [`ReconciliationEngine`] keeping three
//! [`EntityHolder`] trees in agreement:
//!
//! - **Reference** — the desired state, mutated by external change actions
//! - **Running** — the observed state reported by the cluster
//! - **Store** — the last durably persisted state
//!
//! Engines apply one change action at a time; each completed action yields
//! a group of [`ModelUpdateAction`] deltas applied atomically (with revert
//! on partial failure) and emits typed [`ReconcilerEvent`]s. The
//! [`ReconciliationFramework`] owns the engine set, runs the
//! single-threaded trigger loop, maintains ordered indexes over root
//! entities, and fans the merged event stream out to subscribers.
//!
//! The framework exclusively owns its engines; engines carry no pointer
//! back. Cross-engine queries (find-by-child-id, ordered views) live on
//! the framework alone.

pub mod action;
pub mod engine;
pub mod error;
pub mod event;
pub mod framework;
pub mod holder;
pub mod index;
pub mod job;
pub mod update;

pub use action::{ActionFuture, ChangeAction, ModelSnapshot, Reconciler};
pub use engine::{EngineRef, ReconciliationEngine, TriggerStatus};
pub use error::{ReconcileError, ReconcileResult};
pub use event::{EventKind, ModelKind, ReconcilerEvent};
pub use framework::{EngineFactory, ReconciliationFramework};
pub use holder::{EntityHolder, RetryPolicy, Retryer, TagValue};
pub use index::{Comparator, IndexSet};
pub use job::{
    job_root, JobEntity, JobReconciler, LaunchTaskAction, PersistFinishAction, SubmitTaskAction,
    STORE_TIMEOUT_KILL_REASON,
};
pub use update::{ModelUpdateAction, UpdateOp};
