//! Build session: the explicit home of every table shared across one build.

use std::path::PathBuf;

use crate::artifact::ArtifactRegistry;
use crate::include::{IncludeOptions, IncludeResolver};

/// Artifact registry and include caches for one build invocation.
#[derive(Debug)]
pub struct BuildSession {
    /// Every file the build has referenced.
    pub artifacts: ArtifactRegistry,
    /// Include scanning and resolution caches.
    pub includes: IncludeResolver,
    force_deep_scan: bool,
}

impl BuildSession {
    /// Session with default include options, anchoring relative paths at
    /// `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_include_options(root, IncludeOptions::default())
    }

    /// Session with an explicit include scanner policy.
    pub fn with_include_options(root: impl Into<PathBuf>, options: IncludeOptions) -> Self {
        Self {
            artifacts: ArtifactRegistry::new(root),
            includes: IncludeResolver::new(options),
            force_deep_scan: false,
        }
    }

    /// Forget everything learned from the filesystem, e.g. after an external
    /// code generator ran. Include checks afterwards scan exhaustively.
    pub fn invalidate_all(&mut self) {
        self.artifacts.invalidate_all();
        self.includes.reset();
        self.force_deep_scan = true;
    }

    /// Forget cached facts after actions ran, without forcing deep scans.
    pub fn refresh_after_execution(&mut self) {
        self.artifacts.invalidate_all();
        self.includes.reset();
    }

    /// Whether the persisted include cache must be bypassed.
    pub fn force_deep_scan(&self) -> bool {
        self.force_deep_scan
    }
}
