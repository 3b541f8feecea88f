//! Header include resolver and cache.
//!
//! Three layers, each memoized:
//!
//! 1. Direct includes of a file, extracted textually and cached by content
//!    digest for the session.
//! 2. Resolution of one spelling to a file, memoized on the including
//!    artifact per search configuration.
//! 3. Transitive expansion ([`expand`]), in an exhaustive table per search
//!    configuration and a cached-only table materialized from the persisted
//!    [`DependencyCache`].

mod expand;
/// Textual directive scanner.
pub mod scan;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::artifact::{ArtifactId, ArtifactRegistry};
use crate::depcache::{DependencyCache, FlatDependencies};
use crate::error::IncludeError;

pub use expand::{IncludeSet, IncludeTable};
pub use scan::extract_includes;

/// One textual include directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeRef {
    /// Path between the delimiters, as written.
    pub spelling: String,
    /// `<...>` rather than `"..."`.
    pub angled: bool,
    /// 1-based line of the directive.
    pub line: usize,
}

/// Outcome of resolving one spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Found in the including directory or a search path.
    Resolved(ArtifactId),
    /// Not found anywhere; the include is ignored.
    Failed,
}

/// Scanner policy.
#[derive(Debug, Clone, Copy)]
pub struct IncludeOptions {
    /// Also look in system include directories.
    pub search_system_includes: bool,
    /// Accept `\` in include spellings and treat it as a separator.
    pub allow_backslash_separators: bool,
}

impl Default for IncludeOptions {
    fn default() -> Self {
        Self {
            search_system_includes: false,
            allow_backslash_separators: true,
        }
    }
}

/// Ordered include directories of one compile environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SearchPaths {
    /// User include directories, searched first.
    pub user: Vec<PathBuf>,
    /// System include directories, for angled includes.
    pub system: Vec<PathBuf>,
}

/// Interned [`SearchPaths`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SearchSetId(u32);

/// Per-artifact include state, reset whenever the artifact is invalidated.
#[derive(Debug, Default)]
pub(crate) struct IncludeSearchState {
    direct: Option<Arc<[IncludeRef]>>,
    resolved: HashMap<(SearchSetId, String), Resolution>,
}

/// A source whose include set should be rescanned exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeepScanRequest {
    /// Source or header to scan.
    pub source: ArtifactId,
    /// Search configuration of the compile that reads it.
    pub search: SearchSetId,
    /// Also resolve and record the precompiled header.
    pub precompiled_header: bool,
}

/// Session-owned include resolver.
#[derive(Debug, Default)]
pub struct IncludeResolver {
    options: IncludeOptions,
    search_sets: Vec<SearchPaths>,
    search_index: HashMap<SearchPaths, SearchSetId>,
    by_digest: HashMap<[u8; 32], Arc<[IncludeRef]>>,
    exhaustive: HashMap<SearchSetId, IncludeTable>,
    cached_only: HashMap<ArtifactId, Option<IncludeSet>>,
}

impl IncludeResolver {
    /// Empty resolver with the given scanner policy.
    pub fn new(options: IncludeOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Intern a search configuration.
    pub fn intern_search_paths(&mut self, paths: SearchPaths) -> SearchSetId {
        if let Some(&id) = self.search_index.get(&paths) {
            return id;
        }
        let id = SearchSetId(
            u32::try_from(self.search_sets.len()).expect("too many include search configurations"),
        );
        self.search_sets.push(paths.clone());
        self.search_index.insert(paths, id);
        id
    }

    /// The directories behind an interned search set.
    pub fn search_paths(&self, id: SearchSetId) -> &SearchPaths {
        &self.search_sets[id.0 as usize]
    }

    /// Drop all transitive sets. Direct includes cached by digest survive,
    /// since they depend on content alone.
    pub fn reset(&mut self) {
        self.exhaustive.clear();
        self.cached_only.clear();
    }

    /// Direct includes of `file`. A file that does not exist has none.
    pub fn direct_includes(
        &mut self,
        artifacts: &mut ArtifactRegistry,
        file: ArtifactId,
    ) -> Result<Arc<[IncludeRef]>, IncludeError> {
        if let Some(direct) = &artifacts[file].include_state.direct {
            return Ok(Arc::clone(direct));
        }

        let path = artifacts.path(file).to_path_buf();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "include scan of missing file");
                Vec::new()
            }
            Err(source) => return Err(IncludeError::Io { path, source }),
        };

        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        let direct = match self.by_digest.get(&digest) {
            Some(direct) => Arc::clone(direct),
            None => {
                let text = String::from_utf8_lossy(&bytes);
                let refs: Arc<[IncludeRef]> =
                    extract_includes(&path, &text, self.options.allow_backslash_separators)?.into();
                self.by_digest.insert(digest, Arc::clone(&refs));
                refs
            }
        };

        artifacts.get_mut(file).include_state.direct = Some(Arc::clone(&direct));
        Ok(direct)
    }

    /// Resolve one include of `from` under `search`.
    pub fn resolve(
        &mut self,
        artifacts: &mut ArtifactRegistry,
        from: ArtifactId,
        search: SearchSetId,
        include: &IncludeRef,
    ) -> Option<ArtifactId> {
        let key = (search, include.spelling.clone());
        if let Some(&resolution) = artifacts[from].include_state.resolved.get(&key) {
            return match resolution {
                Resolution::Resolved(id) => Some(id),
                Resolution::Failed => None,
            };
        }

        let found = self.search(artifacts, from, search, &include.spelling);
        let resolution = found.map_or(Resolution::Failed, Resolution::Resolved);
        artifacts
            .get_mut(from)
            .include_state
            .resolved
            .insert(key, resolution);
        if found.is_none() {
            debug!(
                from = %artifacts.path(from).display(),
                spelling = %include.spelling,
                "include not resolved"
            );
        }
        found
    }

    fn search(
        &self,
        artifacts: &mut ArtifactRegistry,
        from: ArtifactId,
        search: SearchSetId,
        spelling: &str,
    ) -> Option<ArtifactId> {
        let spelling = if self.options.allow_backslash_separators {
            spelling.replace('\\', "/")
        } else {
            spelling.to_owned()
        };
        let relative = Path::new(&spelling);
        if relative.is_absolute() {
            return probe(artifacts, relative);
        }

        let own_dir = artifacts
            .path(from)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if let Some(id) = probe(artifacts, &own_dir.join(relative)) {
            return Some(id);
        }

        let paths = &self.search_sets[search.0 as usize];
        let system = self
            .options
            .search_system_includes
            .then_some(paths.system.iter())
            .into_iter()
            .flatten();
        for dir in paths.user.iter().chain(system) {
            let candidate = artifacts.absolute(dir).join(relative);
            if let Some(id) = probe(artifacts, &candidate) {
                return Some(id);
            }
        }
        None
    }

    /// Resolved direct includes of `file`, unresolved spellings skipped.
    fn resolved_children(
        &mut self,
        artifacts: &mut ArtifactRegistry,
        file: ArtifactId,
        search: SearchSetId,
    ) -> Result<Vec<ArtifactId>, IncludeError> {
        let direct = self.direct_includes(artifacts, file)?;
        let mut children = Vec::with_capacity(direct.len());
        for include in direct.iter() {
            if let Some(id) = self.resolve(artifacts, file, search, include) {
                if !children.contains(&id) {
                    children.push(id);
                }
            }
        }
        Ok(children)
    }

    /// Exhaustive transitive include set of `source`.
    pub fn transitive_includes(
        &mut self,
        artifacts: &mut ArtifactRegistry,
        source: ArtifactId,
        search: SearchSetId,
    ) -> Result<IncludeSet, IncludeError> {
        let mut table = self.exhaustive.remove(&search).unwrap_or_default();
        if let Some(set) = table.get(source) {
            self.exhaustive.insert(search, table);
            return Ok(set);
        }
        let result = table.expand(source, &mut |file| {
            self.resolved_children(artifacts, file, search)
        });
        self.exhaustive.insert(search, table);
        result
    }

    /// Transitive include set of `source` from the persisted cache only.
    ///
    /// Returns `None` on a cache miss or when a cached include no longer
    /// exists; callers then fall back to [`transitive_includes`].
    ///
    /// [`transitive_includes`]: Self::transitive_includes
    pub fn cached_transitive_includes(
        &mut self,
        artifacts: &mut ArtifactRegistry,
        source: ArtifactId,
        cache: &DependencyCache,
    ) -> Option<IncludeSet> {
        if let Some(memo) = self.cached_only.get(&source) {
            return memo.clone();
        }

        let set = cache.get(artifacts.path(source)).and_then(|deps| {
            let mut set = BTreeSet::new();
            for path in &deps.includes {
                let id = artifacts.intern(path);
                if !artifacts.facts(id).exists {
                    debug!(path = %path.display(), "cached include vanished");
                    return None;
                }
                set.insert(id);
            }
            Some(Arc::new(set))
        });
        self.cached_only.insert(source, set.clone());
        set
    }

    /// The precompiled header of `source`: its first include, resolved.
    pub fn precompiled_header(
        &mut self,
        artifacts: &mut ArtifactRegistry,
        source: ArtifactId,
        search: SearchSetId,
    ) -> Result<ArtifactId, IncludeError> {
        let direct = self.direct_includes(artifacts, source)?;
        let Some(first) = direct.first() else {
            return Err(IncludeError::UnresolvedPrecompiledHeader {
                source_file: artifacts.path(source).to_path_buf(),
                spelling: None,
            });
        };
        self.resolve(artifacts, source, search, first)
            .ok_or_else(|| IncludeError::UnresolvedPrecompiledHeader {
                source_file: artifacts.path(source).to_path_buf(),
                spelling: Some(first.spelling.clone()),
            })
    }

    /// Rescan each request exhaustively and refresh its cache entry.
    ///
    /// Sources that fail to scan are dropped from the cache and logged.
    /// Returns the number of entries refreshed.
    pub fn deep_scan(
        &mut self,
        artifacts: &mut ArtifactRegistry,
        requests: &BTreeSet<DeepScanRequest>,
        cache: &mut DependencyCache,
    ) -> usize {
        let mut refreshed = 0;
        for request in requests {
            match self.flatten(artifacts, request) {
                Ok(deps) => {
                    cache.record(artifacts.path(request.source), deps);
                    refreshed += 1;
                }
                Err(e) => {
                    warn!("include scan failed: {e}");
                    cache.remove(artifacts.path(request.source));
                }
            }
        }
        refreshed
    }

    /// Exhaustively scan `request.source` into its persisted form.
    pub fn flatten(
        &mut self,
        artifacts: &mut ArtifactRegistry,
        request: &DeepScanRequest,
    ) -> Result<FlatDependencies, IncludeError> {
        let set = self.transitive_includes(artifacts, request.source, request.search)?;
        let precompiled_header = if request.precompiled_header {
            let pch = self.precompiled_header(artifacts, request.source, request.search)?;
            Some(artifacts.path(pch).to_path_buf())
        } else {
            None
        };
        Ok(FlatDependencies {
            precompiled_header,
            includes: set.iter().map(|&id| artifacts.path(id).to_path_buf()).collect(),
        })
    }
}

/// Intern `candidate` if it names an existing regular file.
fn probe(artifacts: &mut ArtifactRegistry, candidate: &Path) -> Option<ArtifactId> {
    if let Some(id) = artifacts.lookup(candidate) {
        let facts = artifacts.facts(id);
        return (facts.exists && !facts.is_dir).then_some(id);
    }
    candidate.is_file().then(|| artifacts.intern(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, text: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn paths(artifacts: &ArtifactRegistry, set: &IncludeSet) -> Vec<PathBuf> {
        set.iter().map(|&id| artifacts.path(id).to_path_buf()).collect()
    }

    #[test]
    fn resolves_own_directory_then_user_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.c", "#include \"local.h\"\n#include <lib.h>\n");
        write(dir.path(), "src/local.h", "");
        write(dir.path(), "inc/lib.h", "#include \"local.h\"\n");
        write(dir.path(), "inc/local.h", "");

        let mut artifacts = ArtifactRegistry::new(dir.path());
        let mut resolver = IncludeResolver::default();
        let search = resolver.intern_search_paths(SearchPaths {
            user: vec![PathBuf::from("inc")],
            system: Vec::new(),
        });
        let source = artifacts.intern("src/a.c");
        let set = resolver
            .transitive_includes(&mut artifacts, source, search)
            .unwrap();

        let root = artifacts.root().to_path_buf();
        assert_eq!(
            paths(&artifacts, &set),
            vec![
                root.join("src/local.h"),
                root.join("inc/lib.h"),
                root.join("inc/local.h"),
            ]
        );
    }

    #[test]
    fn system_paths_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.c", "#include <sys.h>\n");
        write(dir.path(), "sys/sys.h", "");
        let paths = SearchPaths {
            user: Vec::new(),
            system: vec![PathBuf::from("sys")],
        };

        let mut artifacts = ArtifactRegistry::new(dir.path());
        let source = artifacts.intern("a.c");
        let mut resolver = IncludeResolver::default();
        let search = resolver.intern_search_paths(paths.clone());
        assert!(resolver
            .transitive_includes(&mut artifacts, source, search)
            .unwrap()
            .is_empty());

        let mut artifacts = ArtifactRegistry::new(dir.path());
        let source = artifacts.intern("a.c");
        let mut resolver = IncludeResolver::new(IncludeOptions {
            search_system_includes: true,
            ..IncludeOptions::default()
        });
        let search = resolver.intern_search_paths(paths);
        assert_eq!(
            resolver
                .transitive_includes(&mut artifacts, source, search)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn include_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.h", "#include \"b.h\"\n");
        write(dir.path(), "b.h", "#include \"a.h\"\n");

        let mut artifacts = ArtifactRegistry::new(dir.path());
        let mut resolver = IncludeResolver::default();
        let search = resolver.intern_search_paths(SearchPaths::default());
        let a = artifacts.intern("a.h");
        let b = artifacts.intern("b.h");
        let set = resolver.transitive_includes(&mut artifacts, a, search).unwrap();
        assert_eq!(set.as_ref(), &BTreeSet::from([a, b]));
        let set = resolver.transitive_includes(&mut artifacts, b, search).unwrap();
        assert_eq!(set.as_ref(), &BTreeSet::from([a, b]));
    }

    #[test]
    fn identical_content_scanned_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "one.c", "#include \"x.h\"\n");
        write(dir.path(), "two.c", "#include \"x.h\"\n");

        let mut artifacts = ArtifactRegistry::new(dir.path());
        let mut resolver = IncludeResolver::default();
        let one = artifacts.intern("one.c");
        let two = artifacts.intern("two.c");
        let a = resolver.direct_includes(&mut artifacts, one).unwrap();
        let b = resolver.direct_includes(&mut artifacts, two).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn precompiled_header_is_first_include() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.c", "#include \"pch.h\"\n#include \"other.h\"\n");
        write(dir.path(), "pch.h", "");
        write(dir.path(), "b.c", "#include \"missing.h\"\n");

        let mut artifacts = ArtifactRegistry::new(dir.path());
        let mut resolver = IncludeResolver::default();
        let search = resolver.intern_search_paths(SearchPaths::default());
        let a = artifacts.intern("a.c");
        let pch = resolver.precompiled_header(&mut artifacts, a, search).unwrap();
        assert!(artifacts.path(pch).ends_with("pch.h"));

        let b = artifacts.intern("b.c");
        let err = resolver
            .precompiled_header(&mut artifacts, b, search)
            .unwrap_err();
        match err {
            IncludeError::UnresolvedPrecompiledHeader {
                source_file,
                spelling,
            } => {
                assert!(source_file.ends_with("b.c"));
                assert_eq!(spelling.as_deref(), Some("missing.h"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cached_only_misses_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.c", "#include \"a.h\"\n");
        write(dir.path(), "a.h", "");

        let mut artifacts = ArtifactRegistry::new(dir.path());
        let mut resolver = IncludeResolver::default();
        let search = resolver.intern_search_paths(SearchPaths::default());
        let source = artifacts.intern("a.c");
        let mut cache = DependencyCache::new();

        assert!(resolver
            .cached_transitive_includes(&mut artifacts, source, &cache)
            .is_none());

        let requests = BTreeSet::from([DeepScanRequest {
            source,
            search,
            precompiled_header: false,
        }]);
        assert_eq!(resolver.deep_scan(&mut artifacts, &requests, &mut cache), 1);

        resolver.reset();
        let set = resolver
            .cached_transitive_includes(&mut artifacts, source, &cache)
            .unwrap();
        assert_eq!(set.len(), 1);
    }
}
