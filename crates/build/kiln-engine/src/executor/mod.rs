//! Executors: run a batch of stale actions.
//!
//! Every executor shares one contract: it receives the batch plus a
//! verbose-stats flag and returns a [`BatchReport`] carrying its name and an
//! overall success flag. Verifying that outputs materialized is left to the
//! caller.

mod dry_run;
mod limit;
mod local;
mod process;

use std::collections::BTreeMap;
use std::fmt;

use crate::action::ActionId;
use crate::artifact::ArtifactRegistry;
use crate::error::ExecutorError;
use crate::graph::ActionGraph;

pub use dry_run::DryRunExecutor;
pub use limit::{ConcurrencyOptions, concurrency_limit};
pub use local::LocalExecutor;
pub use process::split_arguments;

/// Receives each line an action writes to stdout or stderr.
pub type LineSink = dyn Fn(ActionId, &str) + Send + Sync;

/// How one action of a batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The process exited with status zero.
    Succeeded,
    /// The process ran and exited unsuccessfully. `None` if killed by a signal.
    Failed { exit_code: Option<i32> },
    /// The process could not be started.
    LaunchFailed { reason: String },
    /// Never launched because a prerequisite failed.
    Poisoned,
}

impl ActionOutcome {
    /// Returns `true` for [`ActionOutcome::Succeeded`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed {
                exit_code: Some(code),
            } => write!(f, "failed with exit code {code}"),
            Self::Failed { exit_code: None } => f.write_str("terminated by signal"),
            Self::LaunchFailed { reason } => write!(f, "failed to launch: {reason}"),
            Self::Poisoned => f.write_str("skipped, a prerequisite failed"),
        }
    }
}

/// Result of running one batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Name of the executor that ran the batch.
    pub executor: String,
    /// Every action of the batch succeeded.
    pub success: bool,
    /// Outcome per action of the batch.
    pub outcomes: BTreeMap<ActionId, ActionOutcome>,
}

impl BatchReport {
    /// Actions that ended in anything but success, poisoned ones included.
    pub fn failures(&self) -> impl Iterator<Item = (ActionId, &ActionOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(&id, outcome)| (id, outcome))
    }

    /// Number of actions that were actually started.
    pub fn launched(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| !matches!(o, ActionOutcome::Poisoned))
            .count()
    }
}

/// Common interface of the local executor and any other back end.
pub trait Executor {
    fn name(&self) -> &str;

    /// Run `batch` in dependency order. Start and end times are written back
    /// to the actions.
    ///
    /// Failing actions do not make this return `Err`; they are reported in
    /// the [`BatchReport`].
    fn execute(
        &mut self,
        graph: &mut ActionGraph,
        artifacts: &ArtifactRegistry,
        batch: &[ActionId],
        verbose_stats: bool,
    ) -> Result<BatchReport, ExecutorError>;
}
