//! Error types for the build engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::action::ActionId;
use crate::graph::CycleReport;

/// Errors raised while linking or validating the action graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two actions declare the same output.
    #[error("{} is produced by both {existing} and {duplicate}", path.display())]
    DuplicateProducer {
        path: PathBuf,
        existing: ActionId,
        duplicate: ActionId,
    },

    /// Some actions can never run because of a dependency cycle.
    #[error("{0}")]
    Cycle(CycleReport),

    /// A cycle was hit while evaluating actions that skipped the cycle check.
    #[error("action {0} has not passed the cycle check")]
    UncheckedCycle(ActionId),
}

/// Errors raised by the include scanner and resolver.
#[derive(Debug, Error)]
pub enum IncludeError {
    #[error(
        "could not resolve the precompiled header for {}{}",
        source_file.display(),
        spelling.as_deref().map(|s| format!(" (first include is \"{s}\")")).unwrap_or_default()
    )]
    /// The first include of a precompiled-header source did not resolve.
    UnresolvedPrecompiledHeader {
        source_file: PathBuf,
        spelling: Option<String>,
    },

    /// An include directive without a closing delimiter.
    #[error("{}:{line}: malformed include directive \"{spelling}\"", file.display())]
    MalformedDirective {
        file: PathBuf,
        line: usize,
        spelling: String,
    },

    /// A backslash in an include spelling while backslashes are rejected.
    #[error("{}:{line}: include \"{spelling}\" uses a backslash path separator", file.display())]
    WrongSeparator {
        file: PathBuf,
        line: usize,
        spelling: String,
    },

    /// A source or header could not be read.
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while loading or saving persisted engine state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The state file or directory could not be read or written.
    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The state file is not valid JSON of the expected shape.
    #[error("failed to parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The state could not be encoded.
    #[error("failed to serialize {}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by an executor itself, as opposed to failing actions.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Unfinished actions remain but none can launch and none is running.
    #[error("scheduler stalled with {remaining} action(s) neither runnable nor running")]
    Stalled { remaining: usize },

    /// Every worker hung up while completions were still outstanding.
    #[error("a worker thread exited without reporting completion")]
    WorkerLost,
}

/// Any error the engine can return.
#[derive(Debug, Error)]
pub enum Error {
    /// See [`GraphError`].
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// See [`IncludeError`].
    #[error(transparent)]
    Include(#[from] IncludeError),

    /// See [`StateError`].
    #[error(transparent)]
    State(#[from] StateError),

    /// See [`ExecutorError`].
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Filesystem failure while preparing outputs.
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
