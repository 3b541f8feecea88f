//! Build action graph.
//!
//! Actions are nodes; an edge runs from the producer of an artifact to every
//! action listing that artifact as a prerequisite. Edges are not stored:
//! they are derived on demand from the producer back-references that
//! [`ActionGraph::link`] writes into the artifact registry.

mod cycle;
mod order;

use std::collections::BTreeSet;

use crate::action::{Action, ActionDescription, ActionId, ActionKind};
use crate::artifact::{ArtifactId, ArtifactRegistry};
use crate::error::GraphError;
use crate::include::SearchPaths;
use crate::session::BuildSession;

pub use cycle::{CycleEntry, CycleReport};
pub use order::DEPENDENT_COUNT_PASSES;

/// The list of actions of one build, plus their parallelism ordering.
#[derive(Debug, Default)]
pub struct ActionGraph {
    actions: Vec<Action>,
    order: Vec<ActionId>,
}

impl ActionGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an action from its description, interning every path it names.
    pub fn add_action(&mut self, session: &mut BuildSession, desc: &ActionDescription) -> ActionId {
        let id = ActionId::new(self.actions.len());
        let artifacts = &mut session.artifacts;

        let prerequisites: Vec<ArtifactId> =
            desc.prerequisites.iter().map(|p| artifacts.intern(p)).collect();
        let produced: Vec<ArtifactId> = desc.produced.iter().map(|p| artifacts.intern(p)).collect();
        for &output in &produced {
            let artifact = artifacts.get_mut(output);
            artifact.is_remote |= desc.outputs_are_remote;
            if let Some(cost) = desc.relative_cost {
                artifact.relative_cost = cost;
            }
        }

        let working_dir = if desc.working_dir.as_os_str().is_empty() {
            artifacts.root().to_path_buf()
        } else {
            artifacts.absolute(&desc.working_dir)
        };

        let (primary_source, include_search) = if desc.kind == ActionKind::Compile {
            let primary = desc
                .primary_source
                .as_ref()
                .map(|p| artifacts.intern(p))
                .or_else(|| prerequisites.first().copied());
            let paths = SearchPaths {
                user: desc.include_paths.iter().map(|p| artifacts.absolute(p)).collect(),
                system: desc
                    .system_include_paths
                    .iter()
                    .map(|p| artifacts.absolute(p))
                    .collect(),
            };
            (primary, Some(session.includes.intern_search_paths(paths)))
        } else {
            (None, None)
        };

        self.actions.push(Action {
            id,
            kind: desc.kind,
            prerequisites,
            produced,
            working_dir,
            program: desc.program.clone(),
            arguments: desc.arguments.clone(),
            description: desc.description.clone(),
            can_run_remotely: desc.can_run_remotely,
            delete_outputs_if_stale: desc.delete_outputs_if_stale,
            incremental_link: desc.incremental_link,
            produces_import_library: desc.produces_import_library,
            emit_status_line: desc.emit_status_line,
            uses_precompiled_header: desc.uses_precompiled_header,
            primary_source,
            include_search,
            dependent_count: 0,
            relative_cost: 0.0,
            start_time: None,
            end_time: None,
        });
        self.order.push(id);
        id
    }

    /// The action with `id`.
    ///
    /// # Panics
    ///
    /// If `id` does not belong to this graph.
    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.index()]
    }

    /// Mutable access to the action with `id`.
    pub fn action_mut(&mut self, id: ActionId) -> &mut Action {
        &mut self.actions[id.index()]
    }

    /// All actions in creation order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Number of actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` if no action has been added.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Action ids in scheduling preference order. Creation order until
    /// [`sort_for_parallelism`](Self::sort_for_parallelism) runs.
    pub fn order(&self) -> &[ActionId] {
        &self.order
    }

    /// Point every produced artifact at its producer and accumulate each
    /// action's relative cost from its outputs.
    pub fn link(&mut self, artifacts: &mut ArtifactRegistry) -> Result<(), GraphError> {
        for action in &mut self.actions {
            action.relative_cost = 0.0;
            for &output in &action.produced {
                match artifacts.producer(output) {
                    Some(existing) if existing != action.id => {
                        return Err(GraphError::DuplicateProducer {
                            path: artifacts.path(output).to_path_buf(),
                            existing,
                            duplicate: action.id,
                        });
                    }
                    _ => artifacts.set_producer(output, action.id),
                }
                action.relative_cost += artifacts[output].relative_cost;
            }
        }
        Ok(())
    }

    /// Producers of the prerequisites of `id`, deduplicated, in id order.
    pub fn prerequisite_actions(&self, artifacts: &ArtifactRegistry, id: ActionId) -> Vec<ActionId> {
        let set: BTreeSet<ActionId> = self.actions[id.index()]
            .prerequisites
            .iter()
            .filter_map(|&p| artifacts.producer(p))
            .filter(|&producer| producer != id)
            .collect();
        set.into_iter().collect()
    }

    /// The producer of `target` and, transitively, the producers of all of
    /// its prerequisites. Empty if `target` is a pure input.
    pub fn gather_prerequisite_actions(
        &self,
        artifacts: &ArtifactRegistry,
        target: ArtifactId,
    ) -> BTreeSet<ActionId> {
        let mut gathered = BTreeSet::new();
        let mut stack: Vec<ActionId> = artifacts.producer(target).into_iter().collect();
        while let Some(id) = stack.pop() {
            if !gathered.insert(id) {
                continue;
            }
            stack.extend(
                self.actions[id.index()]
                    .prerequisites
                    .iter()
                    .filter_map(|&p| artifacts.producer(p))
                    .filter(|producer| !gathered.contains(producer)),
            );
        }
        gathered
    }
}
