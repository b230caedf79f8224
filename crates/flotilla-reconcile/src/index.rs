//! Ordered indexes over root entities.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::holder::EntityHolder;

/// Named ordering criterion over root reference views.
pub type Comparator<E> =
    Arc<dyn Fn(&EntityHolder<E>, &EntityHolder<E>) -> Ordering + Send + Sync>;

/// Immutable set of ordered views, recomputed by the framework loop when
/// the engine set or any model changes.
pub struct IndexSet<E> {
    comparators: HashMap<String, Comparator<E>>,
    ordered: HashMap<String, Vec<EntityHolder<E>>>,
}

impl<E: Clone> IndexSet<E> {
    pub fn new(comparators: HashMap<String, Comparator<E>>) -> Self {
        let ordered = comparators.keys().map(|k| (k.clone(), Vec::new())).collect();
        Self {
            comparators,
            ordered,
        }
    }

    /// Recompute every ordered view from the given roots.
    pub fn apply(&self, roots: &[EntityHolder<E>]) -> Self {
        let mut ordered = HashMap::new();
        for (criterion, comparator) in &self.comparators {
            let mut view: Vec<EntityHolder<E>> = roots.to_vec();
            view.sort_by(|a, b| comparator(a, b));
            ordered.insert(criterion.clone(), view);
        }
        Self {
            comparators: self.comparators.clone(),
            ordered,
        }
    }

    /// The ordered view for a criterion; empty for unknown criteria.
    pub fn ordered(&self, criterion: &str) -> Vec<EntityHolder<E>> {
        self.ordered.get(criterion).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_id() -> (String, Comparator<u32>) {
        (
            "by-id".to_string(),
            Arc::new(|a: &EntityHolder<u32>, b: &EntityHolder<u32>| a.id().cmp(b.id())),
        )
    }

    fn by_entity_desc() -> (String, Comparator<u32>) {
        (
            "by-entity-desc".to_string(),
            Arc::new(|a: &EntityHolder<u32>, b: &EntityHolder<u32>| b.entity().cmp(a.entity())),
        )
    }

    #[test]
    fn ordered_views_follow_their_comparators() {
        let comparators = HashMap::from([by_id(), by_entity_desc()]);
        let index = IndexSet::new(comparators);

        let roots = vec![
            EntityHolder::new("b", 1),
            EntityHolder::new("a", 2),
            EntityHolder::new("c", 3),
        ];
        let index = index.apply(&roots);

        let ordered_by_id = index.ordered("by-id");
        let ids: Vec<&str> = ordered_by_id.iter().map(|h| h.id()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        let entities: Vec<u32> = index
            .ordered("by-entity-desc")
            .iter()
            .map(|h| *h.entity())
            .collect();
        assert_eq!(entities, [3, 2, 1]);
    }

    #[test]
    fn unknown_criterion_is_empty() {
        let index = IndexSet::<u32>::new(HashMap::new());
        assert!(index.ordered("missing").is_empty());
    }

    #[test]
    fn apply_with_no_roots_clears_views() {
        let index = IndexSet::new(HashMap::from([by_id()]));
        let filled = index.apply(&[EntityHolder::new("a", 1)]);
        assert_eq!(filled.ordered("by-id").len(), 1);
        let emptied = filled.apply(&[]);
        assert!(emptied.ordered("by-id").is_empty());
    }
}
