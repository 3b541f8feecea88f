//! Post-execution checks on link outputs.
//!
//! Executors only report exit status. A linker can exit cleanly without
//! writing its output, so every link action that ran is checked here. In
//! hot-reload mode a `<output>.link-failed` marker records a link that did
//! not produce its output; the next build treats that link as stale.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use kiln_engine::{
    ActionGraph, ActionKind, ActionOutcome, ArtifactRegistry, BatchReport, link_failure_marker,
};
use tracing::{debug, warn};

/// Result of [`verify_link_outputs`].
#[derive(Debug, Default)]
pub struct LinkVerification {
    /// Outputs of successful link actions that are not on disk.
    pub missing: Vec<PathBuf>,
    /// Hot-reload failure markers created.
    pub markers_written: usize,
    /// Hot-reload failure markers removed after a good link.
    pub markers_cleared: usize,
}

/// Check the outputs of every link action in `report`.
pub fn verify_link_outputs(
    graph: &ActionGraph,
    artifacts: &mut ArtifactRegistry,
    report: &BatchReport,
    hot_reload: bool,
) -> Result<LinkVerification> {
    let mut result = LinkVerification::default();

    for (&id, outcome) in &report.outcomes {
        let action = graph.action(id);
        if action.kind != ActionKind::Link {
            continue;
        }
        for &output in &action.produced {
            if artifacts[output].is_remote {
                continue;
            }
            artifacts.invalidate(output);
            let present = artifacts.facts(output).exists;
            let path = artifacts.path(output).to_path_buf();

            if outcome.is_success() && !present {
                warn!("link action {id} reported success but {} is missing", path.display());
                result.missing.push(path.clone());
            }
            if !hot_reload {
                continue;
            }

            let marker = link_failure_marker(&path);
            if outcome.is_success() && present {
                match fs::remove_file(&marker) {
                    Ok(()) => {
                        debug!(marker = %marker.display(), "cleared link failure marker");
                        result.markers_cleared += 1;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("failed to remove {}", marker.display()));
                    }
                }
            } else if *outcome != ActionOutcome::Poisoned {
                fs::write(&marker, format!("{}\n", action.command_line()))
                    .with_context(|| format!("failed to write {}", marker.display()))?;
                debug!(marker = %marker.display(), "recorded link failure");
                result.markers_written += 1;
            }
        }
    }
    Ok(result)
}
