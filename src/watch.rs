//! Feeds filesystem changes into a [`Scheduler`].
//!
//! A [`FileWatcher`] subscribes to a set of paths and globs with a debounced
//! `notify` watcher. Each batch of events is filtered against the requested
//! patterns, turned into [`ChangeEvent`]s and handed to
//! [`Scheduler::handle_invalidation_events`] on a background thread, so the
//! next request in any session recomputes whatever saw the old files.

use std::collections::HashSet;
use std::thread::JoinHandle;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use thiserror::Error;

use crate::invalidation::{ChangeEvent, ChangeKind, InvalidationResult};
use crate::scheduler::Scheduler;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to resolve watch path {path}")]
    Resolve {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("failed to spawn the watch thread")]
    Thread(#[source] std::io::Error),
}

/// A running watch feed. Dropping it stops the feed.
pub struct FileWatcher {
    debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
    thread: Option<JoinHandle<()>>,
    roots: Vec<Utf8PathBuf>,
}

impl FileWatcher {
    /// Watches `paths`, which may be files, directories or globs relative to
    /// the scheduler's build root.
    pub fn start<I, S>(scheduler: &Scheduler, paths: I) -> Result<Self, WatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::start_with(scheduler, paths, |_| {})
    }

    /// Like [`start`](Self::start), calling `callback` after every batch of
    /// changes which invalidated at least one node.
    pub fn start_with<I, S, F>(scheduler: &Scheduler, paths: I, mut callback: F) -> Result<Self, WatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(InvalidationResult) + Send + 'static,
    {
        let build_root = scheduler.config().build_root.clone();

        let mut watched = HashSet::new();
        let mut filters = Vec::new();
        for path in paths {
            let (root, pattern) = resolve_watch_path(&build_root, path)?;
            watched.insert(root);
            filters.push(pattern);
        }

        let roots = collapse_watch_paths(watched);

        let (tx, rx) = std::sync::mpsc::channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(scheduler.config().debounce, None, tx)?;
        for root in &roots {
            tracing::info!("watching {}", root);
            debouncer.watch(root, RecursiveMode::Recursive)?;
        }

        // Events carry canonical paths; nodes observed paths under the
        // configured root.
        let canonical_root = build_root.canonicalize_utf8().unwrap_or_else(|_| build_root.clone());

        let scheduler = scheduler.clone();
        let thread = std::thread::Builder::new()
            .name("tsumiki-watch".into())
            .spawn(move || {
                while let Ok(result) = rx.recv() {
                    let events = match result {
                        Ok(events) => events,
                        Err(errors) => {
                            for error in errors {
                                tracing::error!("watch error: {}", error);
                            }
                            continue;
                        }
                    };

                    let changes: Vec<ChangeEvent> = events
                        .iter()
                        .filter_map(|de| Some((change_kind(&de.event.kind)?, &de.event.paths)))
                        .flat_map(|(kind, paths)| paths.iter().map(move |path| (kind, path)))
                        .filter(|(_, path)| filters.iter().any(|filter| filter.matches_path(path)))
                        .filter_map(|(kind, path)| {
                            let path = Utf8Path::from_path(path)?;
                            Some(ChangeEvent::new(rebase(path, &canonical_root, &build_root), kind))
                        })
                        .collect();

                    if changes.is_empty() {
                        continue;
                    }

                    tracing::debug!("{} changes received", changes.len());
                    let result = scheduler.handle_invalidation_events(&changes);
                    if !result.is_empty() {
                        callback(result);
                    }
                }
            })
            .map_err(WatchError::Thread)?;

        Ok(Self {
            debouncer: Some(debouncer),
            thread: Some(thread),
            roots,
        })
    }

    /// The directories actually subscribed to.
    pub fn roots(&self) -> &[Utf8PathBuf] {
        &self.roots
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        // Dropping the debouncer closes the channel, which ends the thread.
        drop(self.debouncer.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        EventKind::Any | EventKind::Other => Some(ChangeKind::Other),
    }
}

fn rebase(path: &Utf8Path, from: &Utf8Path, onto: &Utf8Path) -> Utf8PathBuf {
    match path.strip_prefix(from) {
        Ok(relative) => onto.join(relative),
        Err(_) => path.to_path_buf(),
    }
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute pattern (for matching). Relative
/// globs resolve against `root`.
pub fn resolve_watch_path(
    root: &Utf8Path,
    glob_str: impl AsRef<str>,
) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let path = root.join(glob_str.as_ref());

    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix_part: Utf8PathBuf = components.iter().skip(split_idx).collect();

    let absolute_root = root_part
        .canonicalize_utf8()
        .map_err(|source| WatchError::Resolve {
            path: path.to_string(),
            source,
        })?;

    // A concrete file is watched through its parent so that atomic
    // replacements are caught.
    let (watch_root, match_pattern) = if suffix_part.as_str().is_empty() && absolute_root.is_file() {
        let parent = absolute_root
            .parent()
            .unwrap_or(&absolute_root)
            .to_path_buf();
        (parent, absolute_root)
    } else {
        let pattern = absolute_root.join(&suffix_part);
        (absolute_root, pattern)
    };

    let pattern = Pattern::new(match_pattern.as_str())?;
    Ok((watch_root, pattern))
}

/// Reduces a set of paths to the minimal set of watch roots. The watcher is
/// recursive, so a path below another one adds nothing.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_dir() -> Utf8PathBuf {
        Utf8Path::new(env!("CARGO_MANIFEST_DIR"))
            .canonicalize_utf8()
            .unwrap()
    }

    #[test]
    fn test_concrete_file() {
        let root = manifest_dir();
        let (watch, pattern) = resolve_watch_path(&root, "Cargo.toml").unwrap();

        assert_eq!(watch, root);
        assert_eq!(pattern.as_str(), root.join("Cargo.toml"));
    }

    #[test]
    fn test_concrete_directory() {
        let root = manifest_dir();
        let (watch, pattern) = resolve_watch_path(&root, "src").unwrap();

        assert_eq!(watch, root.join("src"));
        assert_eq!(pattern.as_str(), root.join("src"));
    }

    #[test]
    fn test_directory_wildcard() {
        let root = manifest_dir();
        let (watch, pattern) = resolve_watch_path(&root, "src/**/*.rs").unwrap();

        assert_eq!(watch, root.join("src"));
        assert_eq!(pattern.as_str(), root.join("src/**/*.rs"));
        assert!(pattern.matches_path(root.join("src/engine/mod.rs").as_std_path()));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let root = manifest_dir();
        let err = resolve_watch_path(&root, "no/such/dir/*.rs").unwrap_err();
        assert!(matches!(err, WatchError::Resolve { .. }));
    }

    #[test]
    fn test_collapse_watch_paths() {
        let paths = HashSet::from([
            Utf8PathBuf::from("/a"),
            Utf8PathBuf::from("/a/b"),
            Utf8PathBuf::from("/a/b/c"),
            Utf8PathBuf::from("/b"),
            Utf8PathBuf::from("/c/d"),
        ]);

        assert_eq!(
            collapse_watch_paths(paths),
            vec![
                Utf8PathBuf::from("/a"),
                Utf8PathBuf::from("/b"),
                Utf8PathBuf::from("/c/d")
            ]
        );
    }

    #[test]
    fn test_collapse_watch_paths_similar_names() {
        let paths = HashSet::from([Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo-bar")]);

        // /foo-bar is not a subdirectory of /foo
        assert_eq!(
            collapse_watch_paths(paths),
            vec![Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo-bar")]
        );
    }

    #[test]
    fn test_change_kinds() {
        use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};

        assert_eq!(change_kind(&EventKind::Access(AccessKind::Any)), None);
        assert_eq!(
            change_kind(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Any)),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            change_kind(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Removed)
        );
    }

    #[test]
    fn test_rebase_onto_build_root() {
        let path = rebase(
            Utf8Path::new("/private/tmp/x/a.txt"),
            Utf8Path::new("/private/tmp/x"),
            Utf8Path::new("/tmp/x"),
        );
        assert_eq!(path, "/tmp/x/a.txt");
        assert_eq!(
            rebase(Utf8Path::new("/elsewhere"), Utf8Path::new("/a"), Utf8Path::new("/b")),
            "/elsewhere"
        );
    }
}
