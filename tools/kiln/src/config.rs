//! Project configuration loaded from `kiln.toml`.
//!
//! Every section and key is optional. A project without the file builds with
//! the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use kiln_engine::{ConcurrencyOptions, IncludeOptions, OutdatednessOptions};
use serde::Deserialize;

/// Name of the configuration file marking a project root.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Target, state location, default plan and executor.
    pub build: BuildSection,
    /// Staleness policy.
    pub outdated: OutdatedSection,
    /// Include scanner policy.
    pub includes: IncludesSection,
    /// Parallelism limits.
    pub concurrency: ConcurrencySection,
}

/// Which executor runs the stale actions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Run actions as local processes.
    #[default]
    Local,
    /// Log actions without running them.
    DryRun,
}

/// `[build]` section.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildSection {
    /// Names the per-target state directory.
    pub target: String,
    /// Root of persisted state, relative to the project root.
    pub state_dir: PathBuf,
    /// Plan used when none is given on the command line.
    pub plan: PathBuf,
    /// Executor used when `--dry-run` is not given.
    pub executor: ExecutorKind,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            target: "default".into(),
            state_dir: PathBuf::from(".kiln"),
            plan: PathBuf::from("plan.json"),
            executor: ExecutorKind::Local,
        }
    }
}

/// `[outdated]` section.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct OutdatedSection {
    /// Tolerated clock skew, in milliseconds.
    pub timestamp_slop_ms: u64,
    /// Compare included headers against outputs.
    pub check_include_timestamps: bool,
    /// Do not relink because an import library is newer.
    pub ignore_outdated_import_libraries: bool,
    /// Compare command lines against the previous build.
    pub use_history: bool,
    /// Keep `.link-failed` markers and relink when one is present.
    pub hot_reload: bool,
}

impl Default for OutdatedSection {
    fn default() -> Self {
        Self {
            timestamp_slop_ms: 1000,
            check_include_timestamps: true,
            ignore_outdated_import_libraries: false,
            use_history: true,
            hot_reload: false,
        }
    }
}

/// `[includes]` section.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct IncludesSection {
    /// Also resolve includes in system directories.
    pub search_system_includes: bool,
    /// Accept `\` in include spellings.
    pub allow_backslash_separators: bool,
}

impl Default for IncludesSection {
    fn default() -> Self {
        let defaults = IncludeOptions::default();
        Self {
            search_system_includes: defaults.search_system_includes,
            allow_backslash_separators: defaults.allow_backslash_separators,
        }
    }
}

/// `[concurrency]` section.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConcurrencySection {
    /// Scales the physical core count.
    pub multiplier: f64,
    /// Hard ceiling on concurrent actions.
    pub max_actions: Option<usize>,
    /// Zero disables the memory cap.
    pub memory_per_action_mb: u64,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            max_actions: None,
            memory_per_action_mb: 1024,
        }
    }
}

impl ProjectConfig {
    /// Parse a configuration document.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse kiln.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `kiln.toml` from `root`, or the defaults if it does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text)
    }

    fn validate(&self) -> Result<()> {
        validate_target(&self.build.target)?;
        if !self.concurrency.multiplier.is_finite() || self.concurrency.multiplier < 0.0 {
            bail!("concurrency.multiplier must be a non-negative number");
        }
        Ok(())
    }

    /// Directory holding the persisted state of `target`.
    pub fn state_dir(&self, root: &Path, target: &str) -> PathBuf {
        root.join(&self.build.state_dir).join(target)
    }

    /// Engine options for the `[outdated]` section.
    pub fn outdated_options(&self) -> OutdatednessOptions {
        OutdatednessOptions {
            timestamp_slop: Duration::from_millis(self.outdated.timestamp_slop_ms),
            check_include_timestamps: self.outdated.check_include_timestamps,
            ignore_outdated_import_libraries: self.outdated.ignore_outdated_import_libraries,
            hot_reload_markers: self.outdated.hot_reload,
        }
    }

    /// Scanner options for the `[includes]` section.
    pub fn include_options(&self) -> IncludeOptions {
        IncludeOptions {
            search_system_includes: self.includes.search_system_includes,
            allow_backslash_separators: self.includes.allow_backslash_separators,
        }
    }

    /// Concurrency inputs. `-j N` (N > 0) lowers the configured ceiling but
    /// never raises it.
    pub fn concurrency_options(&self, jobs: Option<usize>) -> ConcurrencyOptions {
        let max_actions = match (jobs.filter(|&n| n > 0), self.concurrency.max_actions) {
            (Some(jobs), Some(configured)) => Some(jobs.min(configured)),
            (jobs, configured) => jobs.or(configured),
        };
        ConcurrencyOptions {
            multiplier: self.concurrency.multiplier,
            max_actions,
            memory_per_action: (self.concurrency.memory_per_action_mb > 0)
                .then(|| self.concurrency.memory_per_action_mb * 1024 * 1024),
        }
    }
}

/// Target names become a directory under the state dir.
pub fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() || target.contains(['/', '\\']) || target.starts_with('.') {
        bail!("target {target:?} is not a valid directory name");
    }
    Ok(())
}

/// Walk up from `start` to the nearest directory containing `kiln.toml`.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(CONFIG_FILE).exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!("could not find {CONFIG_FILE} in {} or any parent directory", start.display());
        }
    }
}
