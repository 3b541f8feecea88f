//! kiln: incremental build tool.
//!
//! Reads a JSON action plan, decides which actions are out of date and runs
//! them in parallel, keeping command-line history and include caches between
//! builds.
//!
//! Pipeline: load kiln.toml → build graph → check cycles → decide staleness →
//!           execute → verify link outputs → rescan includes.

mod cli;
mod config;
mod logging;
mod pipeline;
mod plan;
mod verify;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use logging::{dprintln, vprintln};
use pipeline::{BuildOptions, Workspace, select_actions};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    logging::init(cli.quiet, cli.verbose);

    match cli.command {
        cli::Command::Build(ref args) => cmd_build(&cli, args),
        cli::Command::Outdated(ref args) => cmd_outdated(&cli, args),
        cli::Command::Graph(ref args) => cmd_graph(&cli, args),
        cli::Command::Clean(ref args) => cmd_clean(&cli, args),
    }
}

/// Locate the project root from `-C` or the current directory.
fn open_workspace(cli: &cli::Cli) -> Result<Workspace> {
    let root = match &cli.directory {
        Some(dir) => dir
            .canonicalize()
            .with_context(|| format!("project directory {} does not exist", dir.display()))?,
        None => config::find_project_root(&std::env::current_dir()?)?,
    };
    vprintln!("Project root: {}", root.display());
    Workspace::open(root)
}

// ===========================================================================
// Commands
// ===========================================================================

/// Bring the plan's outputs up to date.
fn cmd_build(cli: &cli::Cli, args: &cli::BuildArgs) -> Result<()> {
    let workspace = open_workspace(cli)?;
    let plan_path = workspace.plan_path(args.plan.plan.as_deref());
    let options = BuildOptions {
        force: cli.force,
        jobs: cli.jobs,
        dry_run: args.dry_run,
        stats: args.stats,
        outputs: args.output.clone(),
    };

    let summary = workspace.build(&plan_path, &options)?;
    println!(
        "Build complete. ({} of {} actions executed, {} executor)",
        summary.executed, summary.selected, summary.executor
    );
    if summary.deleted > 0 {
        vprintln!("  {} stale outputs deleted before execution", summary.deleted);
    }
    Ok(())
}

/// List stale actions without running anything or saving state.
fn cmd_outdated(cli: &cli::Cli, args: &cli::PlanArgs) -> Result<()> {
    let workspace = open_workspace(cli)?;
    let mut plan = workspace.load_plan(&workspace.plan_path(args.plan.as_deref()))?;
    let selected = select_actions(&plan, &[])?;
    let check = workspace.find_outdated(&mut plan, &selected, cli.force)?;

    for &id in plan.graph.order() {
        if check.set.actions.contains(&id) {
            println!("{id} {}", plan.graph.action(id).status_text());
        }
    }
    dprintln!(
        "{} of {} actions are out of date.",
        check.set.actions.len(),
        selected.len()
    );
    Ok(())
}

/// Check the plan for cycles and print the launch preference order.
fn cmd_graph(cli: &cli::Cli, args: &cli::PlanArgs) -> Result<()> {
    let workspace = open_workspace(cli)?;
    let plan = workspace.load_plan(&workspace.plan_path(args.plan.as_deref()))?;

    println!("{} actions, no cycles. Launch order:", plan.graph.len());
    for &id in plan.graph.order() {
        let action = plan.graph.action(id);
        let waits_on: Vec<String> = plan
            .graph
            .prerequisite_actions(&plan.session.artifacts, id)
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "  {:<5} {:<40} dependents {:<4} cost {:.1}",
            id.to_string(),
            action.status_text(),
            action.dependent_count,
            action.relative_cost
        );
        if !waits_on.is_empty() {
            vprintln!("        after {}", waits_on.join(", "));
        }
    }
    Ok(())
}

/// Remove the persisted history and include cache of one target.
fn cmd_clean(cli: &cli::Cli, args: &cli::CleanArgs) -> Result<()> {
    let workspace = open_workspace(cli)?;
    let target = args
        .target
        .clone()
        .unwrap_or_else(|| workspace.config.build.target.clone());
    config::validate_target(&target)?;
    let state_dir: PathBuf = workspace.config.state_dir(&workspace.root, &target);
    if state_dir.exists() {
        std::fs::remove_dir_all(&state_dir)
            .with_context(|| format!("failed to remove {}", state_dir.display()))?;
        println!("Removed {}", state_dir.display());
    } else {
        println!("Nothing to clean.");
    }
    Ok(())
}
