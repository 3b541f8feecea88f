//! Property tests for cycle detection, outdatedness and include expansion.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::time::{Duration, SystemTime};

use filetime::{FileTime, set_file_mtime};
use kiln_engine::{
    ActionDescription, ActionGraph, ActionId, ActionKind, BuildSession, OutdatednessEngine,
    OutdatednessOptions, SearchPaths,
};
use proptest::prelude::*;

/// Action `i` produces `o{i}`, reads `s{i}` and the outputs of `deps[i]`.
fn build_graph(session: &mut BuildSession, deps: &[Vec<usize>]) -> (ActionGraph, Vec<ActionId>) {
    let mut graph = ActionGraph::new();
    let ids = deps
        .iter()
        .enumerate()
        .map(|(i, inputs)| {
            let mut desc = ActionDescription::new(ActionKind::Compile, "true")
                .prerequisite(format!("s{i}"))
                .produces(format!("o{i}"));
            for j in inputs {
                desc = desc.prerequisite(format!("o{j}"));
            }
            graph.add_action(session, &desc)
        })
        .collect();
    graph.link(&mut session.artifacts).unwrap();
    (graph, ids)
}

/// Adjacency lists where node `i` only depends on nodes below it.
fn dag(max_nodes: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_nodes).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    prop::collection::vec(0..i, 0..=3.min(i)).boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

/// Arbitrary adjacency lists, cycles and self-loops allowed.
fn any_graph(max_nodes: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_nodes).prop_flat_map(|n| prop::collection::vec(prop::collection::vec(0..n, 0..=2), n))
}

/// Transitive closure over "depends on" edges, at least one hop.
fn closure(deps: &[Vec<usize>]) -> Vec<BTreeSet<usize>> {
    (0..deps.len())
        .map(|start| {
            let mut seen = BTreeSet::new();
            let mut stack: Vec<usize> = deps[start].clone();
            while let Some(node) = stack.pop() {
                if seen.insert(node) {
                    stack.extend(deps[node].iter().copied());
                }
            }
            seen
        })
        .collect()
}

proptest! {
    #[test]
    fn acyclic_graphs_resolve_completely(deps in dag(12)) {
        let mut session = BuildSession::new("/p");
        let (graph, _) = build_graph(&mut session, &deps);
        prop_assert!(graph.find_cycles(&session.artifacts).is_none());
        prop_assert!(graph.check_cycles(&session.artifacts).is_ok());
    }

    #[test]
    fn cycle_report_covers_cycles_and_downstream(deps in any_graph(10)) {
        let mut session = BuildSession::new("/p");
        let (graph, ids) = build_graph(&mut session, &deps);

        // `v` is unresolved iff it depends, directly or not, on a node that
        // lies on a cycle, or lies on one itself.
        let reach = closure(&deps);
        let expected: BTreeSet<ActionId> = (0..deps.len())
            .filter(|&v| {
                reach[v].contains(&v) || reach[v].iter().any(|&u| reach[u].contains(&u))
            })
            .map(|v| ids[v])
            .collect();

        let reported = graph
            .find_cycles(&session.artifacts)
            .map(|report| report.actions())
            .unwrap_or_default();
        prop_assert_eq!(reported, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn stale_prerequisites_make_dependents_stale(
        deps in dag(8),
        source_ages in prop::collection::vec(0u64..200, 8),
        output_ages in prop::collection::vec(prop::option::of(0u64..200), 8),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let backdate = |name: String, age: u64| {
            let path = dir.path().join(name);
            fs::write(&path, "x").unwrap();
            set_file_mtime(&path, FileTime::from_system_time(now - Duration::from_secs(age))).unwrap();
        };
        for i in 0..deps.len() {
            backdate(format!("s{i}"), source_ages[i]);
            if let Some(age) = output_ages[i] {
                backdate(format!("o{i}"), age);
            }
        }

        let mut session = BuildSession::new(dir.path());
        let (graph, ids) = build_graph(&mut session, &deps);
        let stale = OutdatednessEngine::new(&graph, &mut session, OutdatednessOptions::default())
            .outdated_actions(ids.clone())
            .unwrap()
            .actions;

        for (i, inputs) in deps.iter().enumerate() {
            for &j in inputs {
                if stale.contains(&ids[j]) {
                    prop_assert!(stale.contains(&ids[i]), "o{} depends on stale o{}", i, j);
                }
            }
        }
    }

    #[test]
    fn include_sets_match_reachability(edges in any_graph(8)) {
        let dir = tempfile::tempdir().unwrap();
        for (i, includes) in edges.iter().enumerate() {
            let text: String = includes.iter().map(|j| format!("#include \"h{j}.h\"\n")).collect();
            fs::write(dir.path().join(format!("h{i}.h")), text).unwrap();
        }

        let mut session = BuildSession::new(dir.path());
        let search = session.includes.intern_search_paths(SearchPaths::default());
        let ids: Vec<_> = (0..edges.len())
            .map(|i| session.artifacts.intern(format!("h{i}.h")))
            .collect();
        let index: HashMap<_, _> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let expected = closure(&edges);

        // Query in reverse so some files are first seen mid-cycle.
        for i in (0..edges.len()).rev() {
            let set = session
                .includes
                .transitive_includes(&mut session.artifacts, ids[i], search)
                .unwrap();
            let got: BTreeSet<usize> = set.iter().map(|id| index[id]).collect();
            prop_assert_eq!(&got, &expected[i], "h{}.h", i);
        }
    }
}
