//! Cycle detection over the linked action graph.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use super::ActionGraph;
use crate::action::ActionId;
use crate::artifact::ArtifactRegistry;
use crate::error::GraphError;

/// One action left unresolved by cycle detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleEntry {
    /// The unresolved action.
    pub action: ActionId,
    /// Its command line, for the diagnostic.
    pub command_line: String,
    /// Its input paths.
    pub prerequisites: Vec<PathBuf>,
    /// Its output paths.
    pub produced: Vec<PathBuf>,
    /// Prerequisite producers that were still unresolved.
    pub waiting_on: Vec<ActionId>,
}

/// Every action on or downstream of a dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// One entry per unresolved action, in id order.
    pub entries: Vec<CycleEntry>,
}

impl CycleReport {
    /// Ids of the unresolved actions.
    pub fn actions(&self) -> BTreeSet<ActionId> {
        self.entries.iter().map(|e| e.action).collect()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "action graph contains a dependency cycle ({} action(s) cannot be scheduled)",
            self.entries.len()
        )?;
        for entry in &self.entries {
            writeln!(f)?;
            writeln!(f, "Action {}: {}", entry.action, entry.command_line)?;
            writeln!(f, "  Prerequisites:")?;
            for path in &entry.prerequisites {
                writeln!(f, "    {}", path.display())?;
            }
            writeln!(f, "  Produces:")?;
            for path in &entry.produced {
                writeln!(f, "    {}", path.display())?;
            }
            let waiting: Vec<String> = entry.waiting_on.iter().map(ToString::to_string).collect();
            writeln!(f, "  Waiting on: {}", waiting.join(", "))?;
        }
        Ok(())
    }
}

impl ActionGraph {
    /// Unresolved actions, or `None` if the graph is acyclic.
    ///
    /// An action resolves once every prerequisite is a pure input or has a
    /// resolved producer. Passes repeat until one adds nothing, so this
    /// terminates after at most one pass per action.
    pub fn find_cycles(&self, artifacts: &ArtifactRegistry) -> Option<CycleReport> {
        let mut resolved = vec![false; self.actions.len()];
        let mut remaining = self.actions.len();

        loop {
            let mut progressed = false;
            for action in &self.actions {
                if resolved[action.id.index()] {
                    continue;
                }
                let ready = action.prerequisites.iter().all(|&p| {
                    artifacts
                        .producer(p)
                        .is_none_or(|producer| resolved[producer.index()])
                });
                if ready {
                    resolved[action.id.index()] = true;
                    remaining -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        if remaining == 0 {
            return None;
        }

        let entries = self
            .actions
            .iter()
            .filter(|action| !resolved[action.id.index()])
            .map(|action| {
                let waiting_on: BTreeSet<ActionId> = action
                    .prerequisites
                    .iter()
                    .filter_map(|&p| artifacts.producer(p))
                    .filter(|producer| !resolved[producer.index()])
                    .collect();
                CycleEntry {
                    action: action.id,
                    command_line: action.command_line(),
                    prerequisites: action
                        .prerequisites
                        .iter()
                        .map(|&p| artifacts.path(p).to_path_buf())
                        .collect(),
                    produced: action
                        .produced
                        .iter()
                        .map(|&p| artifacts.path(p).to_path_buf())
                        .collect(),
                    waiting_on: waiting_on.into_iter().collect(),
                }
            })
            .collect();
        Some(CycleReport { entries })
    }

    /// Fail with the full cycle report if any action cannot be scheduled.
    pub fn check_cycles(&self, artifacts: &ArtifactRegistry) -> Result<(), GraphError> {
        match self.find_cycles(artifacts) {
            Some(report) => Err(GraphError::Cycle(report)),
            None => Ok(()),
        }
    }
}
