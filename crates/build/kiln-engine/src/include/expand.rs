//! Cycle-tolerant transitive include expansion.
//!
//! Each file has a tagged state in an [`IncludeTable`]. A placeholder is
//! stored before recursing, so re-entering a file that is still being
//! expanded returns a pending marker instead of recursing forever. Files whose
//! result depends on an unfinished ancestor are kept provisional and
//! registered with that ancestor; when the ancestor completes, every file
//! registered with it receives the same set, since they all sit in one
//! include cycle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::artifact::ArtifactId;
use crate::error::IncludeError;

/// Transitive include set shared between every file of one include cycle.
pub type IncludeSet = Arc<BTreeSet<ArtifactId>>;

#[derive(Debug)]
enum NodeState {
    InProgress {
        circular_dependents: Vec<ArtifactId>,
    },
    Provisional {
        partial: BTreeSet<ArtifactId>,
        waiting_on: BTreeSet<ArtifactId>,
    },
    Complete(IncludeSet),
}

enum Walk {
    Done(IncludeSet),
    Pending {
        partial: BTreeSet<ArtifactId>,
        waiting_on: BTreeSet<ArtifactId>,
    },
}

/// Memoized transitive include sets for one search configuration.
#[derive(Debug, Default)]
pub struct IncludeTable {
    states: HashMap<ArtifactId, NodeState>,
}

impl IncludeTable {
    /// Completed set of `id`, if already expanded.
    pub fn get(&self, id: ArtifactId) -> Option<IncludeSet> {
        match self.states.get(&id) {
            Some(NodeState::Complete(set)) => Some(Arc::clone(set)),
            _ => None,
        }
    }

    /// Number of files with a completed set.
    #[cfg(test)]
    fn completed(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, NodeState::Complete(_)))
            .count()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    /// Expand `root`, calling `children` for the resolved direct includes of
    /// each file the first time it is visited.
    ///
    /// On error the table is cleared, since placeholders may be left behind.
    pub fn expand<F>(&mut self, root: ArtifactId, children: &mut F) -> Result<IncludeSet, IncludeError>
    where
        F: FnMut(ArtifactId) -> Result<Vec<ArtifactId>, IncludeError>,
    {
        match self.walk(root, children) {
            Ok(Walk::Done(set)) => Ok(set),
            // The root has no unfinished ancestor, so this only happens if a
            // state was left inconsistent; recover by finishing it here.
            Ok(Walk::Pending { partial, .. }) => {
                let set = Arc::new(partial);
                self.states
                    .insert(root, NodeState::Complete(Arc::clone(&set)));
                Ok(set)
            }
            Err(e) => {
                self.states.clear();
                Err(e)
            }
        }
    }

    fn walk<F>(&mut self, id: ArtifactId, children: &mut F) -> Result<Walk, IncludeError>
    where
        F: FnMut(ArtifactId) -> Result<Vec<ArtifactId>, IncludeError>,
    {
        match self.states.get(&id) {
            Some(NodeState::Complete(set)) => return Ok(Walk::Done(Arc::clone(set))),
            Some(NodeState::InProgress { .. }) => {
                return Ok(Walk::Pending {
                    partial: BTreeSet::new(),
                    waiting_on: BTreeSet::from([id]),
                });
            }
            Some(NodeState::Provisional { .. }) => {
                let (partial, waiting_on) = self.pending_view(id);
                return Ok(Walk::Pending { partial, waiting_on });
            }
            None => {}
        }

        self.states.insert(
            id,
            NodeState::InProgress {
                circular_dependents: Vec::new(),
            },
        );

        let mut set = BTreeSet::new();
        let mut waiting_on = BTreeSet::new();
        for child in children(id)? {
            set.insert(child);
            match self.walk(child, children)? {
                Walk::Done(child_set) => set.extend(child_set.iter().copied()),
                Walk::Pending {
                    partial,
                    waiting_on: child_waiting,
                } => {
                    set.extend(partial);
                    waiting_on.extend(child_waiting);
                }
            }
        }
        waiting_on.remove(&id);

        let dependents = match self.states.remove(&id) {
            Some(NodeState::InProgress {
                circular_dependents,
            }) => circular_dependents,
            _ => Vec::new(),
        };

        if waiting_on.is_empty() {
            let set = Arc::new(set);
            for dependent in dependents {
                if !matches!(self.states.get(&dependent), Some(NodeState::Complete(_))) {
                    self.states
                        .insert(dependent, NodeState::Complete(Arc::clone(&set)));
                }
            }
            self.states.insert(id, NodeState::Complete(Arc::clone(&set)));
            return Ok(Walk::Done(set));
        }

        for ancestor in &waiting_on {
            if let Some(NodeState::InProgress {
                circular_dependents,
            }) = self.states.get_mut(ancestor)
            {
                circular_dependents.push(id);
                circular_dependents.extend(dependents.iter().copied());
            }
        }
        self.states.insert(
            id,
            NodeState::Provisional {
                partial: set.clone(),
                waiting_on: waiting_on.clone(),
            },
        );
        Ok(Walk::Pending {
            partial: set,
            waiting_on,
        })
    }

    /// Current partial set of a provisional file, following provisional
    /// waits down to the ancestors that are still being expanded.
    fn pending_view(&self, id: ArtifactId) -> (BTreeSet<ArtifactId>, BTreeSet<ArtifactId>) {
        let mut partial = BTreeSet::new();
        let mut waiting_on = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id];

        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            match self.states.get(&node) {
                Some(NodeState::Provisional {
                    partial: p,
                    waiting_on: w,
                }) => {
                    partial.extend(p.iter().copied());
                    stack.extend(w.iter().copied());
                }
                Some(NodeState::InProgress { .. }) => {
                    waiting_on.insert(node);
                }
                Some(NodeState::Complete(set)) => partial.extend(set.iter().copied()),
                None => {}
            }
        }

        (partial, waiting_on)
    }
}
