//! Parallelism-friendly ordering heuristic.

use std::collections::BTreeSet;

use super::ActionGraph;
use crate::action::ActionId;
use crate::artifact::ArtifactRegistry;

/// Hop limit for dependent-count propagation.
pub const DEPENDENT_COUNT_PASSES: usize = 4;

impl ActionGraph {
    /// Count, per action, the actions depending on it within
    /// [`DEPENDENT_COUNT_PASSES`] hops, then order by that count, relative
    /// cost and prerequisite count (all descending), ties broken by id.
    ///
    /// Only scheduling preference depends on this order.
    pub fn sort_for_parallelism(&mut self, artifacts: &ArtifactRegistry) {
        let n = self.actions.len();

        let mut direct: Vec<BTreeSet<ActionId>> = vec![BTreeSet::new(); n];
        for action in &self.actions {
            for &prerequisite in &action.prerequisites {
                if let Some(producer) = artifacts.producer(prerequisite) {
                    if producer != action.id {
                        direct[producer.index()].insert(action.id);
                    }
                }
            }
        }

        // reach[a] after pass k: dependents of `a` within k hops.
        let mut reach = direct.clone();
        for _ in 1..DEPENDENT_COUNT_PASSES {
            let mut next = reach.clone();
            let mut changed = false;
            for (index, dependents) in direct.iter().enumerate() {
                for dependent in dependents {
                    for &further in &reach[dependent.index()] {
                        changed |= next[index].insert(further);
                    }
                }
            }
            reach = next;
            if !changed {
                break;
            }
        }

        for action in &mut self.actions {
            let dependents = &reach[action.id.index()];
            action.dependent_count = dependents.len() - usize::from(dependents.contains(&action.id));
        }

        let actions = &self.actions;
        self.order = (0..n).map(ActionId::new).collect();
        self.order.sort_by(|&a, &b| {
            let (a, b) = (&actions[a.index()], &actions[b.index()]);
            b.dependent_count
                .cmp(&a.dependent_count)
                .then_with(|| b.relative_cost.total_cmp(&a.relative_cost))
                .then_with(|| b.prerequisites.len().cmp(&a.prerequisites.len()))
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}
