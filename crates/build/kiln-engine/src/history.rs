//! Per-target command-line history.
//!
//! Records, for every produced file, the command line that last produced it.
//! A changed command line makes the producing action stale even when every
//! timestamp says otherwise.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StateError;
use crate::persist;

/// Current schema version. Bump when the file format changes.
const HISTORY_VERSION: u32 = 1;

/// Command-line history persisted as `<state-dir>/command-lines.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandLineHistory {
    version: u32,
    entries: BTreeMap<PathBuf, String>,
    #[serde(skip)]
    dirty: bool,
}

impl Default for CommandLineHistory {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            entries: BTreeMap::new(),
            dirty: false,
        }
    }
}

impl CommandLineHistory {
    /// File name inside the per-target state directory.
    pub const FILE: &'static str = "command-lines.json";

    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the history from `state_dir`.
    ///
    /// A missing, corrupt or version-mismatched file yields an empty history;
    /// the next save overwrites it.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(Self::FILE);
        match persist::load_json::<Self>(&path) {
            Ok(Some(history)) if history.version == HISTORY_VERSION => history,
            Ok(Some(history)) => {
                warn!(
                    path = %path.display(),
                    found = history.version,
                    "discarding command-line history with unknown version"
                );
                Self::default()
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("{e}; starting with empty command-line history");
                Self::default()
            }
        }
    }

    /// Save the history atomically if anything changed since loading.
    pub fn save(&mut self, state_dir: &Path) -> Result<(), StateError> {
        if !self.dirty {
            return Ok(());
        }
        persist::save_json_atomic(&state_dir.join(Self::FILE), self)?;
        self.dirty = false;
        Ok(())
    }

    /// Last recorded command line for `output`.
    pub fn get(&self, output: &Path) -> Option<&str> {
        self.entries.get(output).map(String::as_str)
    }

    /// Record `command_line` for `output`.
    ///
    /// Returns `true` if the stored command differs, ignoring ASCII case, or
    /// if no command was stored yet.
    pub fn update(&mut self, output: &Path, command_line: &str) -> bool {
        match self.entries.get_mut(output) {
            Some(previous) if previous.eq_ignore_ascii_case(command_line) => false,
            Some(previous) => {
                debug!(output = %output.display(), "command line changed");
                command_line.clone_into(previous);
                self.dirty = true;
                true
            }
            None => {
                self.entries
                    .insert(output.to_path_buf(), command_line.to_owned());
                self.dirty = true;
                true
            }
        }
    }

    /// Number of recorded outputs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_reports_new_and_changed_commands() {
        let mut history = CommandLineHistory::new();
        let out = Path::new("/w/a.o");
        assert!(history.update(out, "cc -c a.c"));
        assert!(!history.update(out, "cc -c a.c"));
        assert!(!history.update(out, "CC -C A.C"));
        assert!(history.update(out, "cc -O2 -c a.c"));
        assert_eq!(history.get(out), Some("cc -O2 -c a.c"));
    }

    #[test]
    fn save_and_load_preserve_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = CommandLineHistory::new();
        history.update(Path::new("/w/a.o"), "cc -c a.c");
        history.save(dir.path()).unwrap();

        let loaded = CommandLineHistory::load(dir.path());
        assert_eq!(loaded.get(Path::new("/w/a.o")), Some("cc -c a.c"));
        assert!(!dir.path().join("command-lines.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CommandLineHistory::FILE), "{ nope").unwrap();
        assert!(CommandLineHistory::load(dir.path()).is_empty());
    }

    #[test]
    fn version_mismatch_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CommandLineHistory::FILE),
            r#"{"version": 999, "entries": {"/w/a.o": "cc"}}"#,
        )
        .unwrap();
        assert!(CommandLineHistory::load(dir.path()).is_empty());
    }

    #[test]
    fn unchanged_history_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = CommandLineHistory::new();
        history.save(dir.path()).unwrap();
        assert!(!dir.path().join(CommandLineHistory::FILE).exists());
    }
}
