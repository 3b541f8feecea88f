//! Persisted, flattened include dependencies.
//!
//! Each scanned source maps to the precompiled header it uses (if any) and the
//! full transitive set of files it includes. The outdatedness engine reads
//! this before falling back to an exhaustive scan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StateError;
use crate::persist;

/// Current schema version. Bump when the file format changes.
const DEPCACHE_VERSION: u32 = 1;

/// Flattened include set of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlatDependencies {
    /// Resolved precompiled header, for sources compiled with one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precompiled_header: Option<PathBuf>,
    /// Every file reachable through includes, sorted by path.
    #[serde(default)]
    pub includes: Vec<PathBuf>,
}

/// Flattened include cache persisted as `<state-dir>/include-deps.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyCache {
    version: u32,
    entries: BTreeMap<PathBuf, FlatDependencies>,
    #[serde(skip)]
    dirty: bool,
}

impl Default for DependencyCache {
    fn default() -> Self {
        Self {
            version: DEPCACHE_VERSION,
            entries: BTreeMap::new(),
            dirty: false,
        }
    }
}

impl DependencyCache {
    /// File name inside the per-target state directory.
    pub const FILE: &'static str = "include-deps.json";

    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache from `state_dir`. Missing or unreadable files give an
    /// empty cache.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(Self::FILE);
        match persist::load_json::<Self>(&path) {
            Ok(Some(cache)) if cache.version == DEPCACHE_VERSION => cache,
            Ok(Some(_)) => {
                warn!(path = %path.display(), "discarding include cache with unknown version");
                Self::default()
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("{e}; starting with empty include cache");
                Self::default()
            }
        }
    }

    /// Save the cache atomically if it changed.
    pub fn save(&mut self, state_dir: &Path) -> Result<(), StateError> {
        if !self.dirty {
            return Ok(());
        }
        persist::save_json_atomic(&state_dir.join(Self::FILE), self)?;
        self.dirty = false;
        Ok(())
    }

    /// Cached entry for `source`.
    pub fn get(&self, source: &Path) -> Option<&FlatDependencies> {
        self.entries.get(source)
    }

    /// Store the flattened dependencies of `source`.
    pub fn record(&mut self, source: &Path, deps: FlatDependencies) {
        if self.entries.get(source) != Some(&deps) {
            self.entries.insert(source.to_path_buf(), deps);
            self.dirty = true;
        }
    }

    /// Drop the entry for `source`.
    pub fn remove(&mut self, source: &Path) {
        if self.entries.remove(source).is_some() {
            self.dirty = true;
        }
    }

    /// Number of cached sources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
