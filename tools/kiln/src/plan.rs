//! Action plans: the JSON list of actions handed over by a planner.

use std::path::Path;

use anyhow::{Context, Result, bail};
use kiln_engine::ActionDescription;
use serde::{Deserialize, Serialize};

/// A target and the actions that build it.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActionPlan {
    /// Overrides `build.target` from kiln.toml.
    #[serde(default)]
    pub target: Option<String>,
    /// Actions in plan order.
    pub actions: Vec<ActionDescription>,
}

impl ActionPlan {
    /// Read and check a plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read action plan {}", path.display()))?;
        let plan: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse action plan {}", path.display()))?;
        for (index, action) in plan.actions.iter().enumerate() {
            if action.program.as_os_str().is_empty() {
                bail!("action {index} in {} has no program", path.display());
            }
        }
        Ok(plan)
    }
}
