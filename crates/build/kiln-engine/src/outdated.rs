//! Outdatedness engine.
//!
//! Decides, per action, whether it must run again. Verdicts are memoized for
//! the lifetime of one [`OutdatednessEngine`], and every action recurses into
//! the producers of its prerequisites first, so a stale upstream action makes
//! every downstream action stale.
//!
//! An action is stale if any of these hold, checked in order:
//!
//! 1. the command line recorded for one of its existing outputs differs;
//! 2. an output is missing, or is an empty regular file that is not remote;
//! 3. a prerequisite's producer is stale;
//! 4. a prerequisite is newer than the oldest output by more than the slop;
//! 5. (compile actions) an included file is newer than the oldest output.
//!
//! Stale compile actions queue their scannable prerequisites for an
//! exhaustive include scan, which callers run after execution.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::action::{ActionId, ActionKind};
use crate::artifact::{ArtifactId, ArtifactRegistry};
use crate::depcache::DependencyCache;
use crate::error::{Error, GraphError};
use crate::graph::ActionGraph;
use crate::history::CommandLineHistory;
use crate::include::{IncludeSet, SearchSetId};
use crate::session::BuildSession;

pub use crate::include::DeepScanRequest;

/// Output extensions ignored when computing the oldest output time; some
/// toolchains leave them untouched when their content did not change.
const UNTOUCHED_OUTPUT_EXTENSIONS: [&str; 3] = ["lib", "exp", "pdb"];

/// Extensions of files whose includes are worth scanning.
const SCANNABLE_EXTENSIONS: [&str; 13] = [
    "c", "cc", "cpp", "cxx", "c++", "m", "mm", "h", "hpp", "hh", "hxx", "inl", "ipp",
];

/// Suffix of the marker left next to an output whose last link failed.
const LINK_FAILURE_SUFFIX: &str = ".link-failed";

/// Policy knobs for one outdatedness pass.
#[derive(Debug, Clone, Copy)]
pub struct OutdatednessOptions {
    /// Tolerated clock skew between prerequisites and outputs.
    pub timestamp_slop: Duration,
    /// Compare included files against the oldest output of compile actions.
    pub check_include_timestamps: bool,
    /// Exempt import libraries from the newer-prerequisite rule.
    pub ignore_outdated_import_libraries: bool,
    /// Treat link actions with a failure marker next to their output as
    /// stale.
    pub hot_reload_markers: bool,
}

impl Default for OutdatednessOptions {
    fn default() -> Self {
        Self {
            timestamp_slop: Duration::from_secs(1),
            check_include_timestamps: true,
            ignore_outdated_import_libraries: false,
            hot_reload_markers: false,
        }
    }
}

/// Memoized per-action decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Not visited yet in this pass.
    NotEvaluated,
    /// Outputs are current.
    UpToDate,
    /// Must run again.
    Stale,
}

/// Result of a pass over a set of actions.
#[derive(Debug, Default)]
pub struct OutdatedSet {
    /// Stale actions among those asked about.
    pub actions: BTreeSet<ActionId>,
    /// Sources and headers to rescan exhaustively once execution is done.
    pub deep_scan: BTreeSet<DeepScanRequest>,
}

/// Staleness decisions over one graph, memoized for one pass.
pub struct OutdatednessEngine<'a> {
    graph: &'a ActionGraph,
    session: &'a mut BuildSession,
    options: OutdatednessOptions,
    history: Option<&'a mut CommandLineHistory>,
    dependency_cache: Option<&'a mut DependencyCache>,
    verdicts: Vec<Verdict>,
    in_progress: Vec<bool>,
    deep_scan: BTreeSet<DeepScanRequest>,
}

impl<'a> OutdatednessEngine<'a> {
    /// Engine over `graph` with no history and no dependency cache.
    pub fn new(
        graph: &'a ActionGraph,
        session: &'a mut BuildSession,
        options: OutdatednessOptions,
    ) -> Self {
        Self {
            graph,
            session,
            options,
            history: None,
            dependency_cache: None,
            verdicts: vec![Verdict::NotEvaluated; graph.len()],
            in_progress: vec![false; graph.len()],
            deep_scan: BTreeSet::new(),
        }
    }

    /// Compare and update command lines against `history`.
    #[must_use]
    pub fn with_history(mut self, history: &'a mut CommandLineHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Read include sets from, and record exhaustive scans into, `cache`.
    #[must_use]
    pub fn with_dependency_cache(mut self, cache: &'a mut DependencyCache) -> Self {
        self.dependency_cache = Some(cache);
        self
    }

    /// Evaluate every action in `ids` and return the stale ones.
    pub fn outdated_actions(
        &mut self,
        ids: impl IntoIterator<Item = ActionId>,
    ) -> Result<OutdatedSet, Error> {
        let mut actions = BTreeSet::new();
        for id in ids {
            if self.is_outdated(id)? {
                actions.insert(id);
            }
        }
        Ok(OutdatedSet {
            actions,
            deep_scan: std::mem::take(&mut self.deep_scan),
        })
    }

    /// Whether `id` must run again. Evaluated at most once per engine.
    pub fn is_outdated(&mut self, id: ActionId) -> Result<bool, Error> {
        match self.verdicts[id.index()] {
            Verdict::UpToDate => return Ok(false),
            Verdict::Stale => return Ok(true),
            Verdict::NotEvaluated => {}
        }
        if self.in_progress[id.index()] {
            return Err(GraphError::UncheckedCycle(id).into());
        }

        self.in_progress[id.index()] = true;
        let result = self.evaluate(id);
        self.in_progress[id.index()] = false;
        let stale = result?;

        self.verdicts[id.index()] = if stale {
            Verdict::Stale
        } else {
            Verdict::UpToDate
        };
        if stale {
            self.queue_deep_scan(id);
        }
        Ok(stale)
    }

    fn evaluate(&mut self, id: ActionId) -> Result<bool, Error> {
        let graph = self.graph;
        let action = graph.action(id);
        let mut stale = false;

        if action.produced.is_empty() {
            debug!(action = %id, "produces nothing; always runs");
            stale = true;
        }

        if let Some(history) = self.history.as_deref_mut() {
            let command_line = action.command_line();
            for &output in &action.produced {
                let artifacts = &mut self.session.artifacts;
                let changed = history.update(artifacts.path(output), &command_line);
                if changed && artifacts.facts(output).exists && !stale {
                    debug!(
                        action = %id,
                        output = %artifacts.path(output).display(),
                        "produced by an outdated command line"
                    );
                    stale = true;
                }
            }
        }

        let oldest_output = self.check_outputs(id, &mut stale);

        // Every producer is evaluated, so upstream verdicts are complete even
        // when this action is already known to be stale.
        for producer in graph.prerequisite_actions(&self.session.artifacts, id) {
            if self.is_outdated(producer)? && !stale {
                debug!(action = %id, prerequisite = %producer, "prerequisite action is stale");
                stale = true;
            }
        }

        if !stale {
            if let Some(reference) = oldest_output {
                stale = self.newer_prerequisite(id, reference);
            }
        }

        if action.kind == ActionKind::Compile {
            if let (Some(source), Some(search)) = (action.primary_source, action.include_search) {
                // A source generated by an earlier action has nothing to
                // resolve yet; the post-execution scan checks it.
                if action.uses_precompiled_header && self.session.artifacts.facts(source).exists {
                    let session = &mut *self.session;
                    session
                        .includes
                        .precompiled_header(&mut session.artifacts, source, search)?;
                }
                if !stale && self.options.check_include_timestamps {
                    if let Some(reference) = oldest_output {
                        stale = self.newer_include(id, source, search, reference)?;
                    }
                }
            }
        }

        Ok(stale)
    }

    /// Apply the output rules and return the oldest output time.
    fn check_outputs(&mut self, id: ActionId, stale: &mut bool) -> Option<SystemTime> {
        let action = self.graph.action(id);
        let artifacts = &mut self.session.artifacts;
        let mut oldest = None;
        let mut oldest_any = None;

        for &output in &action.produced {
            let facts = artifacts.facts(output);
            let path = artifacts.path(output);
            if !facts.exists {
                if !*stale {
                    debug!(action = %id, output = %path.display(), "output is missing");
                }
                *stale = true;
                continue;
            }
            if facts.len == 0 && !facts.is_dir && !artifacts[output].is_remote {
                if !*stale {
                    debug!(action = %id, output = %path.display(), "output is empty");
                }
                *stale = true;
            }
            if self.options.hot_reload_markers
                && action.kind == ActionKind::Link
                && link_failure_marker(path).exists()
            {
                if !*stale {
                    debug!(action = %id, output = %path.display(), "previous link failed");
                }
                *stale = true;
            }
            if let Some(modified) = facts.modified {
                oldest_any = earliest(oldest_any, modified);
                if !has_extension(path, &UNTOUCHED_OUTPUT_EXTENSIONS) {
                    oldest = earliest(oldest, modified);
                }
            }
        }

        oldest.or(oldest_any)
    }

    fn newer_prerequisite(&mut self, id: ActionId, reference: SystemTime) -> bool {
        let graph = self.graph;
        let action = graph.action(id);
        let artifacts = &mut self.session.artifacts;

        for &prerequisite in &action.prerequisites {
            let facts = artifacts.facts(prerequisite);
            let Some(modified) = facts.modified.filter(|_| facts.exists) else {
                continue;
            };
            if !is_newer(modified, reference, self.options.timestamp_slop) {
                continue;
            }
            if self.options.ignore_outdated_import_libraries
                && is_import_library(graph, artifacts, prerequisite)
            {
                debug!(
                    action = %id,
                    prerequisite = %artifacts.path(prerequisite).display(),
                    "ignoring newer import library"
                );
                continue;
            }
            debug!(
                action = %id,
                prerequisite = %artifacts.path(prerequisite).display(),
                "prerequisite is newer than the oldest output"
            );
            return true;
        }
        false
    }

    fn newer_include(
        &mut self,
        id: ActionId,
        source: ArtifactId,
        search: SearchSetId,
        reference: SystemTime,
    ) -> Result<bool, Error> {
        let includes = self.include_set(id, source, search)?;
        for &include in includes.iter() {
            let facts = self.session.artifacts.facts(include);
            if let Some(modified) = facts.modified {
                if is_newer(modified, reference, self.options.timestamp_slop) {
                    debug!(
                        action = %id,
                        include = %self.session.artifacts.path(include).display(),
                        "included file is newer than the oldest output"
                    );
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Cached-only include set, upgraded to an exhaustive scan on a cache
    /// miss or when the session forces deep scans.
    fn include_set(
        &mut self,
        id: ActionId,
        source: ArtifactId,
        search: SearchSetId,
    ) -> Result<IncludeSet, Error> {
        let session = &mut *self.session;
        if !session.force_deep_scan() {
            if let Some(cache) = self.dependency_cache.as_deref() {
                if let Some(set) =
                    session
                        .includes
                        .cached_transitive_includes(&mut session.artifacts, source, cache)
                {
                    return Ok(set);
                }
            }
        }

        debug!(action = %id, "scanning includes exhaustively");
        if let Some(cache) = self.dependency_cache.as_deref_mut() {
            let request = DeepScanRequest {
                source,
                search,
                precompiled_header: self.graph.action(id).uses_precompiled_header,
            };
            let deps = session.includes.flatten(&mut session.artifacts, &request)?;
            cache.record(session.artifacts.path(source), deps);
        }
        Ok(session
            .includes
            .transitive_includes(&mut session.artifacts, source, search)?)
    }

    fn queue_deep_scan(&mut self, id: ActionId) {
        let action = self.graph.action(id);
        if action.kind != ActionKind::Compile {
            return;
        }
        let Some(search) = action.include_search else {
            return;
        };
        let artifacts = &self.session.artifacts;
        for &prerequisite in &action.prerequisites {
            if is_include_scannable(artifacts.path(prerequisite)) {
                self.deep_scan.insert(DeepScanRequest {
                    source: prerequisite,
                    search,
                    precompiled_header: action.uses_precompiled_header
                        && action.primary_source == Some(prerequisite),
                });
            }
        }
    }
}

/// `modified` is later than `reference` by more than `slop`.
fn is_newer(modified: SystemTime, reference: SystemTime, slop: Duration) -> bool {
    modified
        .duration_since(reference)
        .is_ok_and(|delta| delta > slop)
}

fn earliest(current: Option<SystemTime>, candidate: SystemTime) -> Option<SystemTime> {
    Some(current.map_or(candidate, |t| t.min(candidate)))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
}

fn is_import_library(graph: &ActionGraph, artifacts: &ArtifactRegistry, id: ArtifactId) -> bool {
    has_extension(artifacts.path(id), &["lib"])
        && artifacts
            .producer(id)
            .is_some_and(|producer| graph.action(producer).produces_import_library)
}

/// Whether `path` looks like a C-family source or header.
pub fn is_include_scannable(path: &Path) -> bool {
    has_extension(path, &SCANNABLE_EXTENSIONS)
}

/// Marker placed next to `output` when its link failed in hot-reload mode.
pub fn link_failure_marker(output: &Path) -> PathBuf {
    let mut name: OsString = output.as_os_str().to_owned();
    name.push(LINK_FAILURE_SUFFIX);
    PathBuf::from(name)
}

/// Delete existing outputs of stale actions that ask for it. Incremental
/// link outputs are always kept. Returns the number of files deleted.
pub fn delete_stale_outputs(
    graph: &ActionGraph,
    artifacts: &mut ArtifactRegistry,
    stale: &BTreeSet<ActionId>,
) -> Result<usize, Error> {
    let mut deleted = 0;
    for &id in stale {
        let action = graph.action(id);
        if !action.delete_outputs_if_stale || action.incremental_link {
            continue;
        }
        for &output in &action.produced {
            let facts = artifacts.facts(output);
            if !facts.exists || facts.is_dir {
                continue;
            }
            let path = artifacts.path(output);
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(output = %path.display(), "deleted stale output");
                    deleted += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(Error::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
            artifacts.invalidate(output);
        }
    }
    Ok(deleted)
}

/// Create the parent directory of every output of the stale actions.
pub fn create_output_directories(
    graph: &ActionGraph,
    artifacts: &ArtifactRegistry,
    stale: &BTreeSet<ActionId>,
) -> Result<(), Error> {
    let dirs: BTreeSet<&Path> = stale
        .iter()
        .flat_map(|&id| graph.action(id).produced.iter())
        .filter_map(|&output| artifacts.path(output).parent())
        .collect();
    for dir in dirs {
        fs::create_dir_all(dir).map_err(|source| Error::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}
