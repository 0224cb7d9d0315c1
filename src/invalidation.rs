//! Reverse index from external observables to the nodes that read them.
//!
//! Nodes register what they read through
//! [`RuleContext::observe`](crate::RuleContext::observe) before reading it.
//! When the outside world reports a change, the index yields every node
//! whose last run may have seen stale data, and the graph cleans them along
//! with everything that transitively depends on them.

use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::ops::Bound;
use std::sync::Mutex;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::Serialize;

use crate::core::lock;
use crate::engine::{EntryId, NodeKey};

/// Something outside the graph that a node can depend on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Observable {
    /// A file or directory. Changes to the path itself, to any of its
    /// ancestors or to anything below it invalidate the node.
    Path(Utf8PathBuf),
    /// Any path matching the pattern.
    Glob(Pattern),
}

impl Observable {
    pub fn path(path: impl AsRef<Utf8Path>) -> Self {
        Observable::Path(normalize(path.as_ref()))
    }

    pub fn glob(pattern: &str) -> Result<Self, glob::PatternError> {
        Ok(Observable::Glob(Pattern::new(pattern)?))
    }
}

impl std::fmt::Display for Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Observable::Path(path) => write!(f, "{path}"),
            Observable::Glob(pattern) => write!(f, "{}", pattern.as_str()),
        }
    }
}

/// Lexically resolves `.` and `..` components.
pub(crate) fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// The kind of change reported by a file watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Other,
}

/// A single change reported by the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    pub path: Utf8PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<Utf8PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Summary of an invalidation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvalidationResult {
    /// Nodes which observed a changed path.
    pub cleared: usize,
    /// Nodes cleaned because something they depend on was.
    pub dirtied: usize,
}

impl InvalidationResult {
    pub fn is_empty(&self) -> bool {
        self.cleared == 0 && self.dirtied == 0
    }
}

type Registrations = HashMap<EntryId, NodeKey>;

/// Paths are ordered component-wise, so everything below a directory sorts
/// directly after it.
type PathShard = Mutex<BTreeMap<Utf8PathBuf, Registrations>>;

pub(crate) struct InvalidationIndex {
    paths: Box<[PathShard]>,
    globs: Mutex<HashMap<Pattern, Registrations>>,
    hasher: RandomState,
}

impl InvalidationIndex {
    pub fn new(shards: usize) -> Self {
        Self {
            paths: (0..shards.max(1)).map(|_| Mutex::default()).collect(),
            globs: Mutex::default(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, path: &Utf8Path) -> &PathShard {
        let hash = self.hasher.hash_one(path);
        &self.paths[hash as usize % self.paths.len()]
    }

    pub fn record_dependency(&self, key: &NodeKey, id: EntryId, observable: &Observable) {
        tracing::trace!("{} observes {}", key, observable);
        match observable {
            Observable::Path(path) => {
                lock(self.shard(path))
                    .entry(path.clone())
                    .or_default()
                    .insert(id, key.clone());
            }
            Observable::Glob(pattern) => {
                lock(&self.globs)
                    .entry(pattern.clone())
                    .or_default()
                    .insert(id, key.clone());
            }
        }
    }

    /// Drops the registrations of a cleaned entry.
    ///
    /// # Panics
    ///
    /// Panics if one of the registrations is missing, which means the index
    /// and the graph went out of sync.
    pub fn remove(&self, id: EntryId, observables: &[Observable]) {
        for observable in observables {
            let removed = match observable {
                Observable::Path(path) => {
                    let mut shard = lock(self.shard(path));
                    let (removed, empty) = remove_from(shard.get_mut(path), id);
                    if empty {
                        shard.remove(path);
                    }
                    removed
                }
                Observable::Glob(pattern) => {
                    let mut globs = lock(&self.globs);
                    let (removed, empty) = remove_from(globs.get_mut(pattern), id);
                    if empty {
                        globs.remove(pattern);
                    }
                    removed
                }
            };

            assert!(
                removed,
                "invalidation index lost the registration of {id:?} on {observable}"
            );
        }
    }

    /// Every node registered against one of the changed paths, one of their
    /// ancestors, anything below them, or a glob matching them.
    ///
    /// Ancestors are point lookups and descendants a range scan per shard;
    /// only glob registrations are tested one by one.
    pub fn lookup(&self, changed: &[Utf8PathBuf]) -> Vec<NodeKey> {
        let mut found: HashMap<EntryId, NodeKey> = HashMap::new();
        let mut collect = |registrations: &Registrations| {
            found.extend(registrations.iter().map(|(id, key)| (*id, key.clone())));
        };

        for path in changed {
            for ancestor in path.ancestors() {
                if let Some(registrations) = lock(self.shard(ancestor)).get(ancestor) {
                    collect(registrations);
                }
            }

            for shard in &self.paths {
                let shard = lock(shard);
                let below = shard
                    .range::<Utf8Path, _>((Bound::Excluded(path.as_path()), Bound::Unbounded))
                    .take_while(|(registered, _)| registered.starts_with(path));
                for (_, registrations) in below {
                    collect(registrations);
                }
            }
        }

        for (pattern, registrations) in lock(&self.globs).iter() {
            if changed
                .iter()
                .any(|changed| pattern.matches_path(changed.as_std_path()))
            {
                collect(registrations);
            }
        }

        found.into_values().collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        let paths: usize = self
            .paths
            .iter()
            .map(|shard| lock(shard).values().map(HashMap::len).sum::<usize>())
            .sum();
        let globs: usize = lock(&self.globs).values().map(HashMap::len).sum();
        paths + globs
    }
}

/// Returns whether `id` was registered, and whether nothing is left.
fn remove_from(registrations: Option<&mut Registrations>, id: EntryId) -> (bool, bool) {
    match registrations {
        Some(registrations) => {
            let removed = registrations.remove(&id).is_some();
            (removed, registrations.is_empty())
        }
        None => (false, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_key;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Utf8Path::new("/a/./b/../c")), "/a/c");
        assert_eq!(normalize(Utf8Path::new("a/../../b")), "../b");
    }

    #[test]
    fn test_lookup_matches_paths_ancestors_and_descendants() {
        let index = InvalidationIndex::new(4);
        let file = test_key("file");
        let dir = test_key("dir");
        let other = test_key("other");

        index.record_dependency(&file, EntryId(1), &Observable::path("/src/lib.rs"));
        index.record_dependency(&dir, EntryId(2), &Observable::path("/src"));
        index.record_dependency(&other, EntryId(3), &Observable::path("/docs/a.md"));

        let mut found = index.lookup(&[Utf8PathBuf::from("/src/lib.rs")]);
        found.sort_by_key(ToString::to_string);
        assert_eq!(found, vec![dir.clone(), file.clone()]);

        let found = index.lookup(&[Utf8PathBuf::from("/docs")]);
        assert_eq!(found, vec![other]);
    }

    #[test]
    fn test_lookup_of_directory_skips_sibling_prefixes() {
        let index = InvalidationIndex::new(8);
        let deep = test_key("deep");
        let shallow = test_key("shallow");
        let sibling = test_key("sibling");

        index.record_dependency(&deep, EntryId(1), &Observable::path("/src/a/b/c.rs"));
        index.record_dependency(&shallow, EntryId(2), &Observable::path("/src/lib.rs"));
        index.record_dependency(&sibling, EntryId(3), &Observable::path("/src-old/lib.rs"));

        let mut found = index.lookup(&[Utf8PathBuf::from("/src")]);
        found.sort_by_key(ToString::to_string);
        assert_eq!(found, vec![deep.clone(), shallow.clone()]);

        let found = index.lookup(&[Utf8PathBuf::from("/")]);
        assert_eq!(found.len(), 3);

        assert!(index.lookup(&[Utf8PathBuf::from("/src/a/x.rs")]).is_empty());
    }

    #[test]
    fn test_lookup_matches_globs() {
        let index = InvalidationIndex::new(1);
        let key = test_key("glob");
        let glob = Observable::glob("/src/**/*.rs").unwrap();
        index.record_dependency(&key, EntryId(7), &glob);

        assert_eq!(index.lookup(&[Utf8PathBuf::from("/src/a/b.rs")]), vec![key]);
        assert!(index.lookup(&[Utf8PathBuf::from("/src/a/b.md")]).is_empty());
    }

    #[test]
    fn test_remove_prunes_registrations() {
        let index = InvalidationIndex::new(2);
        let key = test_key("file");
        let observables = [Observable::path("/a"), Observable::glob("/b/*").unwrap()];
        for observable in &observables {
            index.record_dependency(&key, EntryId(1), observable);
        }
        assert_eq!(index.len(), 2);

        index.remove(EntryId(1), &observables);
        assert_eq!(index.len(), 0);
    }

    #[test]
    #[should_panic(expected = "lost the registration")]
    fn test_remove_of_unknown_registration_panics() {
        let index = InvalidationIndex::new(1);
        index.remove(EntryId(9), &[Observable::path("/nowhere")]);
    }
}
