//! Executor that only reports what it would run.

use std::collections::{BTreeMap, HashSet};
use std::time::SystemTime;

use tracing::info;

use super::{ActionOutcome, BatchReport, Executor};
use crate::action::ActionId;
use crate::artifact::ArtifactRegistry;
use crate::error::ExecutorError;
use crate::graph::ActionGraph;

/// Logs each command in dependency order and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

impl Executor for DryRunExecutor {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn execute(
        &mut self,
        graph: &mut ActionGraph,
        artifacts: &ArtifactRegistry,
        batch: &[ActionId],
        _verbose_stats: bool,
    ) -> Result<BatchReport, ExecutorError> {
        let mut remaining: HashSet<ActionId> = batch.iter().copied().collect();
        let mut outcomes = BTreeMap::new();

        // Emit in an order where every in-batch producer comes first.
        while !remaining.is_empty() {
            let mut ready: Vec<ActionId> = remaining
                .iter()
                .copied()
                .filter(|&id| {
                    graph
                        .prerequisite_actions(artifacts, id)
                        .iter()
                        .all(|p| !remaining.contains(p))
                })
                .collect();
            if ready.is_empty() {
                return Err(ExecutorError::Stalled {
                    remaining: remaining.len(),
                });
            }
            ready.sort();
            for id in ready {
                let now = SystemTime::now();
                let action = graph.action_mut(id);
                info!("[dry-run] {}", action.command_line());
                action.start_time = Some(now);
                action.end_time = Some(now);
                remaining.remove(&id);
                outcomes.insert(id, ActionOutcome::Succeeded);
            }
        }

        Ok(BatchReport {
            executor: self.name().to_owned(),
            success: true,
            outcomes,
        })
    }
}
