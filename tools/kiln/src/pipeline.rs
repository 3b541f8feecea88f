//! Build pipeline: plan → graph → outdatedness → execution → bookkeeping.
//!
//! Phases, in order:
//! 1. load the plan, link the graph, reject cycles, sort for parallelism
//! 2. narrow to the actions needed for `--output` paths, if any
//! 3. decide the stale set against history, timestamps and include sets
//! 4. flush history, delete stale outputs, create output directories
//! 5. run the executor, then verify link outputs
//! 6. rescan includes of stale compile actions and persist the cache

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use kiln_engine::{
    ActionGraph, ActionId, BuildSession, CommandLineHistory, DependencyCache, DryRunExecutor,
    Executor, LineSink, LocalExecutor, OutdatedSet, OutdatednessEngine, create_output_directories,
    delete_stale_outputs,
};
use tracing::debug;

use crate::config::{ExecutorKind, ProjectConfig, validate_target};
use crate::logging::{Timer, dprintln, vprintln};
use crate::plan::ActionPlan;
use crate::verify::verify_link_outputs;

/// A project root and its configuration.
pub struct Workspace {
    /// Directory holding `kiln.toml`.
    pub root: PathBuf,
    pub config: ProjectConfig,
}

/// A plan turned into a checked, ordered action graph.
pub struct LoadedPlan {
    /// Target name from the plan, else the configured one.
    pub target: String,
    /// Where history and include caches of the target live.
    pub state_dir: PathBuf,
    pub session: BuildSession,
    pub graph: ActionGraph,
}

/// Flags from the `build` command line.
#[derive(Debug, Default)]
pub struct BuildOptions {
    pub force: bool,
    pub jobs: Option<usize>,
    pub dry_run: bool,
    pub stats: bool,
    pub outputs: Vec<PathBuf>,
}

/// What a finished build did.
#[derive(Debug)]
pub struct BuildSummary {
    /// Name of the executor that ran the batch.
    pub executor: String,
    /// Actions actually launched.
    pub executed: usize,
    /// Actions considered after `--output` filtering.
    pub selected: usize,
    /// Stale outputs removed before execution.
    pub deleted: usize,
}

/// Stale set plus the persisted state it was decided against.
pub struct StaleCheck {
    pub set: OutdatedSet,
    pub history: CommandLineHistory,
    pub cache: DependencyCache,
}

impl Workspace {
    /// Load the configuration of the project at `root`.
    pub fn open(root: PathBuf) -> Result<Self> {
        let config = ProjectConfig::load(&root)?;
        Ok(Self { root, config })
    }

    /// The plan named on the command line, else the configured one.
    pub fn plan_path(&self, explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => self.root.join(&self.config.build.plan),
        }
    }

    /// Load `plan_path` and build the graph for it.
    pub fn load_plan(&self, plan_path: &Path) -> Result<LoadedPlan> {
        let _t = Timer::start("graph construction");
        let plan = ActionPlan::load(plan_path)?;
        let target = plan
            .target
            .clone()
            .unwrap_or_else(|| self.config.build.target.clone());
        validate_target(&target)?;
        let state_dir = self.config.state_dir(&self.root, &target);

        let mut session = BuildSession::with_include_options(&self.root, self.config.include_options());
        let mut graph = ActionGraph::new();
        for desc in &plan.actions {
            graph.add_action(&mut session, desc);
        }
        graph.link(&mut session.artifacts)?;
        graph.check_cycles(&session.artifacts)?;
        graph.sort_for_parallelism(&session.artifacts);
        vprintln!("Loaded {} actions for target '{target}'", graph.len());

        Ok(LoadedPlan {
            target,
            state_dir,
            session,
            graph,
        })
    }

    /// Decide which of `selected` must run.
    ///
    /// With `force` every selected action is stale; the history is still
    /// brought up to date so the next build starts from it.
    pub fn find_outdated(&self, plan: &mut LoadedPlan, selected: &[ActionId], force: bool) -> Result<StaleCheck> {
        let _t = Timer::start("outdatedness check");
        let mut history = if self.config.outdated.use_history {
            CommandLineHistory::load(&plan.state_dir)
        } else {
            CommandLineHistory::new()
        };
        let mut cache = DependencyCache::load(&plan.state_dir);

        let mut engine = OutdatednessEngine::new(&plan.graph, &mut plan.session, self.config.outdated_options())
            .with_dependency_cache(&mut cache);
        if self.config.outdated.use_history {
            engine = engine.with_history(&mut history);
        }
        let mut set = engine.outdated_actions(selected.iter().copied())?;

        if force {
            set.actions = selected.iter().copied().collect();
        }
        debug!(stale = set.actions.len(), selected = selected.len(), "outdatedness decided");
        Ok(StaleCheck { set, history, cache })
    }

    /// Run a full build of the plan at `plan_path`.
    pub fn build(&self, plan_path: &Path, options: &BuildOptions) -> Result<BuildSummary> {
        let mut plan = self.load_plan(plan_path)?;
        let selected = select_actions(&plan, &options.outputs)?;
        let mut check = self.find_outdated(&mut plan, &selected, options.force)?;
        let dry_run = options.dry_run || self.config.build.executor == ExecutorKind::DryRun;

        let stale = &check.set.actions;
        let mut deleted = 0;
        if !dry_run {
            if self.config.outdated.use_history {
                check
                    .history
                    .save(&plan.state_dir)
                    .context("failed to save command-line history")?;
            }
            deleted = delete_stale_outputs(&plan.graph, &mut plan.session.artifacts, stale)?;
            create_output_directories(&plan.graph, &plan.session.artifacts, stale)?;
            if deleted > 0 {
                vprintln!("Deleted {deleted} stale outputs");
            }
        }

        let batch: Vec<ActionId> = plan
            .graph
            .order()
            .iter()
            .copied()
            .filter(|id| stale.contains(id))
            .collect();
        let mut executor = self.executor(dry_run, options.jobs);

        if batch.is_empty() {
            dprintln!("Target '{}' is up to date.", plan.target);
        } else {
            dprintln!("Running {} actions with the {} executor...", batch.len(), executor.name());
        }
        let report = {
            let _t = Timer::start("execution");
            executor.execute(&mut plan.graph, &plan.session.artifacts, &batch, options.stats)?
        };

        // A dry run leaves every piece of persisted state untouched.
        let mut missing = Vec::new();
        if !dry_run {
            plan.session.refresh_after_execution();
            let links = verify_link_outputs(
                &plan.graph,
                &mut plan.session.artifacts,
                &report,
                self.config.outdated.hot_reload,
            )?;
            if links.markers_written + links.markers_cleared > 0 {
                vprintln!(
                    "Link failure markers: {} written, {} cleared",
                    links.markers_written,
                    links.markers_cleared
                );
            }
            missing = links.missing;

            let _t = Timer::start("include rescan");
            let refreshed = plan.session.includes.deep_scan(
                &mut plan.session.artifacts,
                &check.set.deep_scan,
                &mut check.cache,
            );
            vprintln!("Rescanned includes of {refreshed} sources");
            check
                .cache
                .save(&plan.state_dir)
                .context("failed to save include cache")?;
        }

        let failed = report.failures().count();
        if failed > 0 {
            bail!(
                "{} of {} actions did not complete ({} launched)",
                failed,
                batch.len(),
                report.launched()
            );
        }
        if !missing.is_empty() {
            let list: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            bail!("link outputs missing after a successful run: {}", list.join(", "));
        }

        Ok(BuildSummary {
            executed: report.launched(),
            executor: report.executor,
            selected: selected.len(),
            deleted,
        })
    }

    fn executor(&self, dry_run: bool, jobs: Option<usize>) -> Box<dyn Executor> {
        if dry_run {
            return Box::new(DryRunExecutor);
        }
        let sink: Arc<LineSink> = Arc::new(|_id: ActionId, line: &str| eprintln!("{line}"));
        let local = LocalExecutor::from_options(&self.config.concurrency_options(jobs)).with_sink(sink);
        vprintln!("Concurrency limit: {}", local.limit());
        Box::new(local)
    }
}

/// Actions needed to produce `outputs`, in graph order; every action when
/// `outputs` is empty.
pub fn select_actions(plan: &LoadedPlan, outputs: &[PathBuf]) -> Result<Vec<ActionId>> {
    if outputs.is_empty() {
        return Ok(plan.graph.order().to_vec());
    }
    let artifacts = &plan.session.artifacts;
    let mut wanted = BTreeSet::new();
    for output in outputs {
        let id = artifacts
            .lookup(output)
            .filter(|&id| artifacts.producer(id).is_some())
            .with_context(|| format!("no action produces {}", output.display()))?;
        wanted.extend(plan.graph.gather_prerequisite_actions(artifacts, id));
    }
    Ok(plan
        .graph
        .order()
        .iter()
        .copied()
        .filter(|id| wanted.contains(id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(dir: &Path, plan: &str) -> (Workspace, PathBuf) {
        let path = dir.join("plan.json");
        std::fs::write(&path, plan).unwrap();
        (Workspace::open(dir.to_path_buf()).unwrap(), path)
    }

    const CHAIN: &str = r#"{ "actions": [
        { "kind": "compile", "program": "cc", "prerequisites": ["a.c"], "produced": ["a.o"] },
        { "kind": "compile", "program": "cc", "prerequisites": ["b.c"], "produced": ["b.o"] },
        { "kind": "link", "program": "ld", "prerequisites": ["a.o"], "produced": ["liba.so"] }
    ] }"#;

    #[test]
    fn output_filter_keeps_only_needed_actions() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, path) = workspace(dir.path(), CHAIN);
        let plan = ws.load_plan(&path).unwrap();
        assert_eq!(plan.target, "default");
        assert_eq!(plan.state_dir, dir.path().join(".kiln/default"));

        let all = select_actions(&plan, &[]).unwrap();
        assert_eq!(all.len(), 3);
        let some = select_actions(&plan, &[PathBuf::from("liba.so")]).unwrap();
        let names: BTreeSet<&str> = some.iter().map(|&id| plan.graph.action(id).program.to_str().unwrap()).collect();
        assert_eq!(some.len(), 2);
        assert_eq!(names, BTreeSet::from(["cc", "ld"]));
        assert!(select_actions(&plan, &[PathBuf::from("a.c")]).is_err());
    }

    #[test]
    fn cyclic_plan_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, path) = workspace(
            dir.path(),
            r#"{ "actions": [
                { "kind": "compile", "program": "x", "prerequisites": ["b"], "produced": ["a"] },
                { "kind": "compile", "program": "y", "prerequisites": ["a"], "produced": ["b"] }
            ] }"#,
        );
        let err = ws.load_plan(&path).err().unwrap();
        assert!(format!("{err:#}").contains("cycle"));
    }

    #[test]
    fn force_marks_every_selected_action_stale() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.c", "b.c", "a.o", "b.o", "liba.so"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let (ws, path) = workspace(dir.path(), CHAIN);
        let mut plan = ws.load_plan(&path).unwrap();
        let selected = select_actions(&plan, &[]).unwrap();

        let forced = ws.find_outdated(&mut plan, &selected, true).unwrap();
        assert_eq!(forced.set.actions.len(), 3);
        assert_eq!(forced.history.len(), 3);
    }
}
