//! End-to-end scenarios: plan, decide, execute, rebuild.
//!
//! Actions are `/bin/sh -c` snippets, so these only run on Unix.

#![cfg(unix)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::{FileTime, set_file_mtime};
use kiln_engine::{
    ActionDescription, ActionGraph, ActionId, ActionKind, ActionOutcome, BuildSession,
    CommandLineHistory, DependencyCache, Executor, LocalExecutor, OutdatednessEngine,
    OutdatednessOptions,
};

struct Project {
    dir: tempfile::TempDir,
    session: BuildSession,
    graph: ActionGraph,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let session = BuildSession::new(dir.path());
        Self {
            dir,
            session,
            graph: ActionGraph::new(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `rel` and backdate it by `age_secs`.
    fn source(&self, rel: &str, text: &str, age_secs: u64) {
        let path = self.root().join(rel);
        fs::write(&path, text).unwrap();
        set_mtime(&path, SystemTime::now() - Duration::from_secs(age_secs));
    }

    fn shell(&mut self, kind: ActionKind, inputs: &[&str], output: &str, script: &str) -> ActionId {
        let mut desc = ActionDescription::new(kind, "/bin/sh")
            .produces(output)
            .arguments(format!("-c '{script}'"))
            .description(format!("{} {output}", kind.as_str()));
        for input in inputs {
            desc = desc.prerequisite(*input);
        }
        self.graph.add_action(&mut self.session, &desc)
    }

    fn finish_graph(&mut self) {
        self.graph.link(&mut self.session.artifacts).unwrap();
        self.graph.check_cycles(&self.session.artifacts).unwrap();
        self.graph.sort_for_parallelism(&self.session.artifacts);
    }

    fn outdated(&mut self) -> BTreeSet<ActionId> {
        self.session.refresh_after_execution();
        let ids = self.graph.order().to_vec();
        OutdatednessEngine::new(&self.graph, &mut self.session, OutdatednessOptions::default())
            .outdated_actions(ids)
            .unwrap()
            .actions
    }

    fn run(&mut self, stale: &BTreeSet<ActionId>, limit: usize) -> kiln_engine::BatchReport {
        let batch: Vec<ActionId> = stale.iter().copied().collect();
        LocalExecutor::new(limit)
            .execute(&mut self.graph, &self.session.artifacts, &batch, false)
            .unwrap()
    }

    /// compile a.c, compile b.c, link both into `out`.
    fn two_file_program(&mut self) -> (ActionId, ActionId, ActionId) {
        self.source("a.c", "int a;\n", 100);
        self.source("b.c", "int b;\n", 100);
        let a = self.shell(ActionKind::Compile, &["a.c"], "a.o", "cat a.c > a.o");
        let b = self.shell(ActionKind::Compile, &["b.c"], "b.o", "cat b.c > b.o");
        let l = self.shell(ActionKind::Link, &["a.o", "b.o"], "out", "cat a.o b.o > out");
        self.finish_graph();
        (a, b, l)
    }
}

fn set_mtime(path: &Path, time: SystemTime) {
    set_file_mtime(path, FileTime::from_system_time(time)).unwrap();
}

fn finished_before(graph: &ActionGraph, first: ActionId, second: ActionId) -> bool {
    let end = graph.action(first).end_time.unwrap();
    let start = graph.action(second).start_time.unwrap();
    end <= start
}

#[test]
fn clean_build_runs_compiles_before_link() {
    let mut project = Project::new();
    let (a, b, l) = project.two_file_program();

    let stale = project.outdated();
    assert_eq!(stale, BTreeSet::from([a, b, l]));

    let report = project.run(&stale, 2);
    assert!(report.success);
    assert_eq!(report.executor, "local");
    assert!(report.outcomes.values().all(|o| *o == ActionOutcome::Succeeded));
    assert!(finished_before(&project.graph, a, l));
    assert!(finished_before(&project.graph, b, l));
    assert_eq!(
        fs::read_to_string(project.root().join("out")).unwrap(),
        "int a;\nint b;\n"
    );
}

#[test]
fn second_run_without_changes_is_up_to_date() {
    let mut project = Project::new();
    project.two_file_program();
    let stale = project.outdated();
    assert!(project.run(&stale, 2).success);

    let stale = project.outdated();
    assert!(stale.is_empty());
    let report = project.run(&stale, 2);
    assert!(report.success);
    assert!(report.outcomes.is_empty());
}

#[test]
fn touching_one_source_rebuilds_it_and_the_link() {
    let mut project = Project::new();
    let (a, b, l) = project.two_file_program();
    let stale = project.outdated();
    assert!(project.run(&stale, 2).success);

    set_mtime(
        &project.root().join("a.c"),
        SystemTime::now() + Duration::from_secs(60),
    );
    let stale = project.outdated();
    assert_eq!(stale, BTreeSet::from([a, l]));
    assert!(!stale.contains(&b));
}

#[test]
fn chain_runs_strictly_in_order() {
    for limit in [1, 2, 8] {
        let mut project = Project::new();
        project.source("seed", "x\n", 100);
        let a = project.shell(ActionKind::BuildProject, &["seed"], "a", "sleep 0.05; cat seed > a");
        let b = project.shell(ActionKind::BuildProject, &["a"], "b", "sleep 0.05; cat a > b");
        let c = project.shell(ActionKind::BuildProject, &["b"], "c", "cat b > c");
        project.finish_graph();

        let stale = project.outdated();
        let report = project.run(&stale, limit);
        assert!(report.success, "limit {limit}");
        assert!(finished_before(&project.graph, a, b), "limit {limit}");
        assert!(finished_before(&project.graph, b, c), "limit {limit}");
    }
}

#[test]
fn failure_poisons_transitive_dependents() {
    let mut project = Project::new();
    project.source("seed", "x\n", 100);
    let a = project.shell(ActionKind::Compile, &["seed"], "a", "exit 1");
    let b = project.shell(ActionKind::Compile, &["a"], "b", "touch b");
    let c = project.shell(ActionKind::Link, &["b"], "c", "touch c");
    let d = project.shell(ActionKind::Compile, &["seed"], "d", "touch d");
    project.finish_graph();

    let stale = project.outdated();
    assert_eq!(stale, BTreeSet::from([a, b, c, d]));
    let report = project.run(&stale, 4);

    assert!(!report.success);
    assert_eq!(report.outcomes[&a], ActionOutcome::Failed { exit_code: Some(1) });
    assert_eq!(report.outcomes[&b], ActionOutcome::Poisoned);
    assert_eq!(report.outcomes[&c], ActionOutcome::Poisoned);
    assert_eq!(report.outcomes[&d], ActionOutcome::Succeeded);
    assert_eq!(report.launched(), 2);
    assert!(!project.root().join("b").exists());
    assert!(project.graph.action(b).start_time.is_none());
}

#[test]
fn touched_header_makes_compile_stale() {
    let mut project = Project::new();
    project.source("main.c", "#include \"config.h\"\n", 100);
    project.source("config.h", "#define X 1\n", 100);
    let compile = project.shell(ActionKind::Compile, &["main.c"], "main.o", "cat main.c > main.o");
    let link = project.shell(ActionKind::Link, &["main.o"], "app", "cat main.o > app");
    project.finish_graph();

    let stale = project.outdated();
    assert!(project.run(&stale, 2).success);
    assert!(project.outdated().is_empty());

    set_mtime(
        &project.root().join("config.h"),
        SystemTime::now() + Duration::from_secs(60),
    );
    assert_eq!(project.outdated(), BTreeSet::from([compile, link]));
}

#[test]
fn history_and_include_cache_survive_between_runs() {
    let mut project = Project::new();
    project.source("main.c", "#include \"config.h\"\n", 100);
    project.source("config.h", "", 100);
    let compile = project.shell(ActionKind::Compile, &["main.c"], "main.o", "cat main.c > main.o");
    project.finish_graph();
    let state = project.root().join(".kiln");

    let run_pass = |project: &mut Project| {
        let mut history = CommandLineHistory::load(&state);
        let mut cache = DependencyCache::load(&state);
        project.session.refresh_after_execution();
        let ids = project.graph.order().to_vec();
        let result = OutdatednessEngine::new(&project.graph, &mut project.session, OutdatednessOptions::default())
            .with_history(&mut history)
            .with_dependency_cache(&mut cache)
            .outdated_actions(ids)
            .unwrap();
        history.save(&state).unwrap();
        let report = project.run(&result.actions, 2);
        assert!(report.success);
        project.session.refresh_after_execution();
        project
            .session
            .includes
            .deep_scan(&mut project.session.artifacts, &result.deep_scan, &mut cache);
        cache.save(&state).unwrap();
        result.actions
    };

    assert_eq!(run_pass(&mut project), BTreeSet::from([compile]));
    assert!(state.join(CommandLineHistory::FILE).exists());
    assert!(state.join(DependencyCache::FILE).exists());
    assert!(run_pass(&mut project).is_empty());

    let cache = DependencyCache::load(&state);
    let entry = cache.get(&project.root().join("main.c")).unwrap();
    assert_eq!(entry.includes, vec![project.root().join("config.h")]);

    // A changed command line is picked up from the persisted history.
    project.graph.action_mut(compile).arguments = "-c 'cat main.c main.c > main.o'".into();
    assert_eq!(run_pass(&mut project), BTreeSet::from([compile]));
}

#[test]
fn generated_source_with_precompiled_header() {
    let mut project = Project::new();
    project.source("gen.in", "#include \"pch.h\"\nint g;\n", 100);
    project.source("pch.h", "", 100);
    let generate = project.shell(ActionKind::Compile, &["gen.in"], "gen.c", "cat gen.in > gen.c");
    let mut desc = ActionDescription::new(ActionKind::Compile, "/bin/sh")
        .prerequisite("gen.c")
        .produces("gen.o")
        .arguments("-c 'cat gen.c > gen.o'");
    desc.uses_precompiled_header = true;
    let compile = project.graph.add_action(&mut project.session, &desc);
    project.finish_graph();

    let stale = project.outdated();
    assert_eq!(stale, BTreeSet::from([generate, compile]));
    assert!(project.run(&stale, 2).success);

    // Once generated, the source resolves its precompiled header.
    project.session.refresh_after_execution();
    let gen_c = project.session.artifacts.lookup("gen.c").unwrap();
    let search = project.graph.action(compile).include_search.unwrap();
    let request = kiln_engine::DeepScanRequest {
        source: gen_c,
        search,
        precompiled_header: true,
    };
    let mut cache = DependencyCache::new();
    let refreshed = project.session.includes.deep_scan(
        &mut project.session.artifacts,
        &BTreeSet::from([request]),
        &mut cache,
    );
    assert_eq!(refreshed, 1);
    assert_eq!(
        cache.get(&project.root().join("gen.c")).unwrap().precompiled_header,
        Some(project.root().join("pch.h"))
    );
    assert!(project.outdated().is_empty());
}
