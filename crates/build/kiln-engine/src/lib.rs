//! Incremental build engine.
//!
//! Given a materialized list of build actions with file-level inputs and
//! outputs, the engine links them into a graph, rejects cycles, decides which
//! actions are stale and runs the stale subset with bounded parallelism in
//! dependency order.
//!
//! Pipeline: [`ActionGraph::add_action`] → [`ActionGraph::link`] →
//! [`ActionGraph::check_cycles`] → [`ActionGraph::sort_for_parallelism`] →
//! [`OutdatednessEngine`] → [`Executor::execute`] →
//! [`IncludeResolver::deep_scan`].
//!
//! All shared tables (artifact registry, include caches) live in a
//! [`BuildSession`]; nothing in this crate uses process-wide state.

pub mod action;
pub mod artifact;
pub mod depcache;
pub mod error;
pub mod executor;
pub mod graph;
pub mod history;
pub mod include;
pub mod outdated;
mod persist;
pub mod session;

pub use action::{Action, ActionDescription, ActionId, ActionKind};
pub use artifact::{ArtifactId, ArtifactRegistry, FileArtifact, FileFacts};
pub use depcache::{DependencyCache, FlatDependencies};
pub use error::{Error, ExecutorError, GraphError, IncludeError, StateError};
pub use executor::{
    ActionOutcome, BatchReport, ConcurrencyOptions, DryRunExecutor, Executor, LineSink,
    LocalExecutor, concurrency_limit,
};
pub use graph::{ActionGraph, CycleEntry, CycleReport};
pub use history::CommandLineHistory;
pub use include::{IncludeOptions, IncludeRef, IncludeResolver, SearchPaths, SearchSetId};
pub use outdated::{
    DeepScanRequest, OutdatedSet, OutdatednessEngine, OutdatednessOptions,
    create_output_directories, delete_stale_outputs, link_failure_marker,
};
pub use session::BuildSession;
