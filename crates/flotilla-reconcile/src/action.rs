//! Change actions and the difference resolver.

use std::future::Future;
use std::pin::Pin;

use crate::error::ReconcileResult;
use crate::holder::EntityHolder;
use crate::update::ModelUpdateAction;

/// Boxed future produced by a change action.
pub type ActionFuture<E> =
    Pin<Box<dyn Future<Output = ReconcileResult<Vec<ModelUpdateAction<E>>>> + Send>>;

/// Read-only view of an engine's three models, handed to a starting
/// action.
#[derive(Debug, Clone)]
pub struct ModelSnapshot<E> {
    pub reference: EntityHolder<E>,
    pub running: EntityHolder<E>,
    pub store: EntityHolder<E>,
}

/// An externally or internally triggered request to mutate the models.
///
/// `apply` performs any asynchronous work (store writes, cluster calls)
/// and resolves to the group of model deltas to apply. The group is
/// applied atomically; if it cannot be applied in full, or `apply` itself
/// fails, the engine applies `compensating_updates` before the next
/// action runs.
pub trait ChangeAction<E>: Send + Sync {
    /// Short human-readable description carried on events.
    fn summary(&self) -> String;

    /// Deltas restoring consistency if this action fails. Used, for
    /// instance, to roll a Reference update back after a store timeout.
    fn compensating_updates(&self, _models: &ModelSnapshot<E>) -> Vec<ModelUpdateAction<E>> {
        Vec::new()
    }

    /// Run the action against a snapshot of the models.
    fn apply(&self, models: &ModelSnapshot<E>) -> ActionFuture<E>;
}

/// Synthesizes internal change actions by diffing the models.
///
/// Invoked only when an engine's external change queue is empty. Failed
/// actions are not retried by the engine; the resolver re-derives them
/// from the diff on a later trigger, pacing itself with the retry tags on
/// the root holder.
pub trait Reconciler<E>: Send + Sync {
    fn resolve(
        &self,
        models: &ModelSnapshot<E>,
        now_ms: u64,
    ) -> Vec<Box<dyn ChangeAction<E>>>;
}
