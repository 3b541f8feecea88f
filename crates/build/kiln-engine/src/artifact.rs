//! Deduplicated registry of file artifacts.
//!
//! Every path that takes part in a build is interned exactly once per
//! session and addressed by an [`ArtifactId`]. The record caches filesystem
//! facts lazily, carries the producer back-reference set when the action
//! graph is linked, and holds the per-file include-search state.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::ops::Index;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::action::ActionId;
use crate::include::IncludeSearchState;

/// Handle to one interned artifact. Indexes the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactId(u32);

impl ArtifactId {
    /// Position of this artifact in the registry arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Cached filesystem facts for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFacts {
    /// Whether the path existed when stat'ed.
    pub exists: bool,
    /// Size in bytes; zero when missing.
    pub len: u64,
    /// Last modification time, if the platform reports one.
    pub modified: Option<SystemTime>,
    /// The path is a directory.
    pub is_dir: bool,
}

impl FileFacts {
    const MISSING: Self = Self {
        exists: false,
        len: 0,
        modified: None,
        is_dir: false,
    };

    fn stat(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) => Self {
                exists: true,
                len: meta.len(),
                modified: meta.modified().ok(),
                is_dir: meta.is_dir(),
            },
            Err(_) => Self::MISSING,
        }
    }
}

/// One file or directory that participates in the build.
#[derive(Debug)]
pub struct FileArtifact {
    path: PathBuf,
    facts: Option<FileFacts>,
    producer: Option<ActionId>,
    /// Built in a different filesystem namespace; size checks do not apply.
    pub is_remote: bool,
    /// Tie-break weight summed into the producing action's cost.
    pub relative_cost: f64,
    pub(crate) include_state: IncludeSearchState,
}

impl FileArtifact {
    /// Absolute, lexically normalized path of this artifact.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The action that produces this artifact, if linked.
    pub fn producer(&self) -> Option<ActionId> {
        self.producer
    }

    /// Facts from the last stat, if one happened since the last invalidation.
    pub fn cached_facts(&self) -> Option<FileFacts> {
        self.facts
    }
}

/// Session-wide table mapping absolute paths to artifact records.
///
/// Exactly one record exists per distinct path; relative paths are anchored
/// at the registry root before lookup.
#[derive(Debug)]
pub struct ArtifactRegistry {
    root: PathBuf,
    artifacts: Vec<FileArtifact>,
    by_path: HashMap<PathBuf, ArtifactId>,
}

impl ArtifactRegistry {
    /// Create an empty registry anchoring relative paths at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize_path(&root.into()),
            artifacts: Vec::new(),
            by_path: HashMap::new(),
        }
    }

    /// Directory relative paths are resolved against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make `path` absolute against the registry root and normalize it.
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&self.root.join(path))
        }
    }

    /// Return the artifact for `path`, creating it on first reference.
    pub fn intern(&mut self, path: impl AsRef<Path>) -> ArtifactId {
        let path = self.absolute(path.as_ref());
        if let Some(&id) = self.by_path.get(&path) {
            return id;
        }
        let id = ArtifactId(
            u32::try_from(self.artifacts.len()).expect("artifact registry exceeded u32::MAX entries"),
        );
        self.artifacts.push(FileArtifact {
            path: path.clone(),
            facts: None,
            producer: None,
            is_remote: false,
            relative_cost: 1.0,
            include_state: IncludeSearchState::default(),
        });
        self.by_path.insert(path, id);
        id
    }

    /// Look up an already-interned path without creating a record.
    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<ArtifactId> {
        self.by_path.get(&self.absolute(path.as_ref())).copied()
    }

    /// Path of an artifact.
    pub fn path(&self, id: ArtifactId) -> &Path {
        &self.artifacts[id.index()].path
    }

    /// Mutable access to an artifact record.
    pub fn get_mut(&mut self, id: ArtifactId) -> &mut FileArtifact {
        &mut self.artifacts[id.index()]
    }

    /// Producing action of an artifact, if any.
    pub fn producer(&self, id: ArtifactId) -> Option<ActionId> {
        self.artifacts[id.index()].producer
    }

    pub(crate) fn set_producer(&mut self, id: ArtifactId, action: ActionId) {
        self.artifacts[id.index()].producer = Some(action);
    }

    /// Filesystem facts for an artifact, statting the path on first use.
    pub fn facts(&mut self, id: ArtifactId) -> FileFacts {
        let artifact = &mut self.artifacts[id.index()];
        *artifact
            .facts
            .get_or_insert_with(|| FileFacts::stat(&artifact.path))
    }

    /// Forget the cached facts and include state of one artifact.
    pub fn invalidate(&mut self, id: ArtifactId) {
        let artifact = &mut self.artifacts[id.index()];
        artifact.facts = None;
        artifact.include_state = IncludeSearchState::default();
    }

    /// Forget every cached fact, e.g. after an external code generator ran.
    pub fn invalidate_all(&mut self) {
        for artifact in &mut self.artifacts {
            artifact.facts = None;
            artifact.include_state = IncludeSearchState::default();
        }
    }

    /// Number of interned artifacts.
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns `true` if nothing has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl Index<ArtifactId> for ArtifactRegistry {
    type Output = FileArtifact;

    fn index(&self, id: ArtifactId) -> &FileArtifact {
        &self.artifacts[id.index()]
    }
}

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component. Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
