//! Command-line interface definitions for kiln.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Incremental build engine driven by JSON action plans.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Project root (defaults to the nearest directory containing kiln.toml).
    #[arg(long, short = 'C', global = true)]
    pub directory: Option<PathBuf>,

    /// Treat every action as stale, bypassing history and timestamps.
    #[arg(long, short = 'f', global = true)]
    pub force: bool,

    /// Suppress status lines; show only errors and the final summary.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable verbose output with staleness reasons and timings.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Maximum number of concurrent actions, never above `max-actions` in kiln.toml
    /// (0 or omitted = derive from the host).
    #[arg(long, short = 'j', global = true)]
    pub jobs: Option<usize>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Bring the plan's outputs up to date.
    Build(BuildArgs),
    /// List the actions that would run, without running them.
    Outdated(PlanArgs),
    /// Check the plan for cycles and print the parallel-friendly order.
    Graph(PlanArgs),
    /// Remove the persisted state of a target.
    Clean(CleanArgs),
}

/// Plan selection shared by every subcommand that reads one.
#[derive(Args)]
pub struct PlanArgs {
    /// Action plan file (defaults to `build.plan` from kiln.toml).
    pub plan: Option<PathBuf>,
}

/// Arguments for the `build` subcommand.
#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Only build the actions needed to produce these outputs.
    #[arg(long, short = 'o')]
    pub output: Vec<PathBuf>,

    /// Log each command instead of running it.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the slowest actions once the build finishes.
    #[arg(long)]
    pub stats: bool,
}

/// Arguments for the `clean` subcommand.
#[derive(Args)]
pub struct CleanArgs {
    /// Target whose state to remove (defaults to `build.target`).
    #[arg(long, short = 't')]
    pub target: Option<String>,
}
