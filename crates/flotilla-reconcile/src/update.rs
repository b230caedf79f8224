//! Model update actions and the pure apply function.
//!
//! A [`ModelUpdateAction`] is a single typed delta against one of the three
//! model trees. `apply` is pure and idempotent: applying the same delta
//! twice yields the same tree, which is what makes atomic group
//! application and rollback straightforward.

use crate::error::{ReconcileError, ReconcileResult};
use crate::event::ModelKind;
use crate::holder::{EntityHolder, TagValue};

/// The tree transform a delta performs.
#[derive(Debug, Clone)]
pub enum UpdateOp<E> {
    /// Insert a child under the root, replacing a same-id child.
    AddChild(EntityHolder<E>),
    /// Remove a child by id (no-op when absent).
    RemoveChild { id: String },
    /// Replace the root's own entity payload.
    UpdateRoot { entity: E },
    /// Replace the entity of the child with the given id.
    UpdateEntity { id: String, entity: E },
    /// Set a tag on the root holder.
    SetTag { key: String, value: TagValue },
    /// Remove a tag from the root holder (no-op when absent).
    RemoveTag { key: String },
}

/// One delta, naming its target model.
#[derive(Debug, Clone)]
pub struct ModelUpdateAction<E> {
    pub target: ModelKind,
    pub op: UpdateOp<E>,
    pub summary: String,
}

impl<E> ModelUpdateAction<E> {
    pub fn new(target: ModelKind, op: UpdateOp<E>, summary: impl Into<String>) -> Self {
        Self {
            target,
            op,
            summary: summary.into(),
        }
    }
}

/// Apply one delta to a tree, returning the new tree.
pub fn apply<E: Clone>(
    tree: &EntityHolder<E>,
    op: &UpdateOp<E>,
) -> ReconcileResult<EntityHolder<E>> {
    match op {
        UpdateOp::AddChild(child) => Ok(tree.clone().with_child(child.clone())),
        UpdateOp::RemoveChild { id } => Ok(tree.clone().without_child(id)),
        UpdateOp::UpdateRoot { entity } => Ok(tree.clone().with_entity(entity.clone())),
        UpdateOp::UpdateEntity { id, entity } => tree
            .clone()
            .with_child_entity(id, entity.clone())
            .ok_or_else(|| {
                ReconcileError::InvalidUpdate(format!(
                    "no child {id} under root {}",
                    tree.id()
                ))
            }),
        UpdateOp::SetTag { key, value } => {
            Ok(tree.clone().with_tag(key.clone(), value.clone()))
        }
        UpdateOp::RemoveTag { key } => Ok(tree.clone().without_tag(key)),
    }
}
