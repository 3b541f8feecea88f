//! Build actions: one schedulable unit of work each.
//!
//! An [`ActionDescription`] is the serialized form handed over by whatever
//! planned the build; [`ActionGraph::add_action`](crate::ActionGraph::add_action)
//! turns it into an [`Action`] whose inputs and outputs are interned
//! artifacts.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;
use crate::include::SearchSetId;

/// Stable identity of an action, assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(u32);

impl ActionId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("action graph exceeded u32::MAX actions"))
    }

    /// Position of this action in the graph.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Category of an action.
///
/// Only compile actions get special treatment (include scanning); the rest is
/// used for statistics and ordering heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// Invokes another build system on a whole project.
    BuildProject,
    /// Translates one source file; its includes are scanned.
    Compile,
    /// Packages produced files together.
    Bundle,
    /// Extracts or post-processes debug information.
    DebugInfo,
    /// Links objects into a binary or library.
    Link,
}

impl ActionKind {
    /// The kebab-case name used in plans and status lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildProject => "build-project",
            Self::Compile => "compile",
            Self::Bundle => "bundle",
            Self::DebugInfo => "debug-info",
            Self::Link => "link",
        }
    }
}

/// Serialized action as produced by the planning phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActionDescription {
    /// Category of the action.
    pub kind: ActionKind,
    /// Files read by the action, relative to the session root or absolute.
    #[serde(default)]
    pub prerequisites: Vec<PathBuf>,
    /// Files written by the action.
    #[serde(default)]
    pub produced: Vec<PathBuf>,
    /// Empty means the session root.
    #[serde(default)]
    pub working_dir: PathBuf,
    /// Executable to launch.
    pub program: PathBuf,
    /// Argument string; split on whitespace outside quotes at launch.
    #[serde(default)]
    pub arguments: String,
    /// Short human-readable label for status lines.
    #[serde(default)]
    pub description: String,
    /// The action may be handed to a remote executor.
    #[serde(default)]
    pub can_run_remotely: bool,
    /// Remove existing outputs before a stale action runs.
    #[serde(default)]
    pub delete_outputs_if_stale: bool,
    /// The linker updates its output in place, so it is never deleted.
    #[serde(default)]
    pub incremental_link: bool,
    /// One of the outputs is an import library (`.lib`).
    #[serde(default)]
    pub produces_import_library: bool,
    /// Log the status text when the action launches.
    #[serde(default)]
    pub emit_status_line: bool,
    /// Source whose first include names the precompiled header. Defaults to
    /// the first prerequisite of a compile action.
    #[serde(default)]
    pub primary_source: Option<PathBuf>,
    /// User include directories, searched for quoted and angled includes.
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    /// System include directories, searched for angled includes only.
    #[serde(default)]
    pub system_include_paths: Vec<PathBuf>,
    /// The first include of the primary source names a precompiled header.
    #[serde(default)]
    pub uses_precompiled_header: bool,
    /// Outputs live on a remote store; an empty local stub is not stale.
    #[serde(default)]
    pub outputs_are_remote: bool,
    /// Cost weight applied to every produced artifact.
    #[serde(default)]
    pub relative_cost: Option<f64>,
}

impl ActionDescription {
    /// Start a description with no inputs, outputs or arguments.
    pub fn new(kind: ActionKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            prerequisites: Vec::new(),
            produced: Vec::new(),
            working_dir: PathBuf::new(),
            program: program.into(),
            arguments: String::new(),
            description: String::new(),
            can_run_remotely: false,
            delete_outputs_if_stale: false,
            incremental_link: false,
            produces_import_library: false,
            emit_status_line: false,
            primary_source: None,
            include_paths: Vec::new(),
            system_include_paths: Vec::new(),
            uses_precompiled_header: false,
            outputs_are_remote: false,
            relative_cost: None,
        }
    }

    /// Add a prerequisite path.
    #[must_use]
    pub fn prerequisite(mut self, path: impl Into<PathBuf>) -> Self {
        self.prerequisites.push(path.into());
        self
    }

    /// Add a produced path.
    #[must_use]
    pub fn produces(mut self, path: impl Into<PathBuf>) -> Self {
        self.produced.push(path.into());
        self
    }

    /// Set the argument string.
    #[must_use]
    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set the human-readable description.
    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    /// Add a user include directory.
    #[must_use]
    pub fn include_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_paths.push(dir.into());
        self
    }
}

/// One unit of work in the action graph.
#[derive(Debug, Clone)]
pub struct Action {
    /// Position in the owning graph.
    pub id: ActionId,
    /// Category of the action.
    pub kind: ActionKind,
    /// Interned input files.
    pub prerequisites: Vec<ArtifactId>,
    /// Interned output files.
    pub produced: Vec<ArtifactId>,
    /// Absolute directory the process starts in.
    pub working_dir: PathBuf,
    /// Executable to launch.
    pub program: PathBuf,
    /// Argument string, before `$VAR` expansion.
    pub arguments: String,
    /// Short human-readable label for status lines.
    pub description: String,
    /// See [`ActionDescription::can_run_remotely`].
    pub can_run_remotely: bool,
    /// See [`ActionDescription::delete_outputs_if_stale`].
    pub delete_outputs_if_stale: bool,
    /// See [`ActionDescription::incremental_link`].
    pub incremental_link: bool,
    /// See [`ActionDescription::produces_import_library`].
    pub produces_import_library: bool,
    /// See [`ActionDescription::emit_status_line`].
    pub emit_status_line: bool,
    /// See [`ActionDescription::uses_precompiled_header`].
    pub uses_precompiled_header: bool,
    /// Compile actions only.
    pub primary_source: Option<ArtifactId>,
    /// Compile actions only.
    pub include_search: Option<SearchSetId>,
    /// Actions depending on this one, within the propagation hop limit.
    pub dependent_count: usize,
    /// Accumulated cost used to order launches.
    pub relative_cost: f64,
    /// Set by the executor when the process starts.
    pub start_time: Option<SystemTime>,
    /// Set by the executor when the process exits.
    pub end_time: Option<SystemTime>,
}

impl Action {
    /// Program and arguments as one string; this is the fingerprint recorded
    /// in the command-line history.
    pub fn command_line(&self) -> String {
        if self.arguments.is_empty() {
            self.program.display().to_string()
        } else {
            format!("{} {}", self.program.display(), self.arguments)
        }
    }

    /// Wall-clock run time, once an executor has filled in both timestamps.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.start_time?, self.end_time?);
        end.duration_since(start).ok()
    }

    /// Text used for status lines: the description, or the command line.
    pub fn status_text(&self) -> String {
        if self.description.is_empty() {
            self.command_line()
        } else {
            self.description.clone()
        }
    }
}
