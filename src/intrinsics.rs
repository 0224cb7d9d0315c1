//! Primitive rules giving the graph access to the filesystem and to
//! subprocesses.
//!
//! Each primitive observes what it reads before reading it, so a change
//! reported to the scheduler invalidates exactly the nodes which saw the old
//! data. Install them with [`RuleSet::with_intrinsics`].

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Digest;
use crate::engine::RuleContext;
use crate::error::{Failure, RegistryError};
use crate::invalidation::Observable;
use crate::rules::RuleSet;

/// A file to read, relative to the build root or absolute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilePath(pub Utf8PathBuf);

impl FilePath {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self(path.into())
    }
}

/// The content of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileContent {
    /// Absolute path of the file.
    pub path: Utf8PathBuf,
    pub digest: Digest,
    pub content: Arc<[u8]>,
}

impl FileContent {
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// Glob patterns, relative to the build root or absolute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathGlobs(pub Vec<String>);

impl PathGlobs {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(patterns.into_iter().map(Into::into).collect())
    }
}

/// The files matched by a [`PathGlobs`], with their digests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Snapshot {
    /// Sorted. Paths under the build root are relative to it.
    pub files: Vec<(Utf8PathBuf, Digest)>,
    /// Digest of the whole listing, paths included.
    pub digest: Digest,
}

impl Snapshot {
    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.files.iter().map(|(path, _)| path.as_path())
    }
}

/// A subprocess to run.
///
/// Processes run in place against the real filesystem; nothing is
/// sandboxed or materialized from a content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Process {
    pub argv: Vec<String>,
    /// Digest of the files the process reads, usually a [`Snapshot`]
    /// digest. It is part of the identity of the process, so a request with
    /// changed inputs runs it again instead of reusing an earlier result.
    pub input_digest: Option<Digest>,
    /// Added to the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Relative to the build root. Defaults to the build root.
    pub cwd: Option<Utf8PathBuf>,
    /// The process is killed once it runs longer than this.
    pub timeout: Option<Duration>,
    pub description: Option<String>,
}

impl Process {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            input_digest: None,
            env: BTreeMap::new(),
            cwd: None,
            timeout: None,
            description: None,
        }
    }

    pub fn input_digest(mut self, digest: Digest) -> Self {
        self.input_digest = Some(digest);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn label(&self) -> String {
        match &self.description {
            Some(description) => description.clone(),
            None => self.argv.join(" "),
        }
    }
}

/// The captured outcome of a [`Process`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessResult {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: Arc<[u8]>,
    pub stderr: Arc<[u8]>,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    /// Digest over stdout, stderr and the exit code.
    pub output_digest: Digest,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.stdout).ok()
    }
}

pub(crate) fn register(rules: &mut RuleSet) -> Result<(), RegistryError> {
    rules
        .rule()
        .name("read_file")
        .inputs::<(FilePath,)>()
        .run_async(read_file)?;
    rules
        .rule()
        .name("snapshot")
        .inputs::<(PathGlobs,)>()
        .run_async(snapshot)?;
    rules
        .rule()
        .name("run_process")
        .inputs::<(Process,)>()
        .run_async(run_process)?;

    rules.query::<FileContent>().param::<FilePath>().register()?;
    rules.query::<Snapshot>().param::<PathGlobs>().register()?;
    rules.query::<ProcessResult>().param::<Process>().register()?;
    Ok(())
}

async fn read_file(ctx: RuleContext, (file,): (FilePath,)) -> anyhow::Result<FileContent> {
    let path = ctx.observe_path(&file.0);
    let content = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {path}"))?;

    Ok(FileContent {
        digest: Digest::hash(&content),
        content: content.into(),
        path,
    })
}

async fn snapshot(ctx: RuleContext, (globs,): (PathGlobs,)) -> anyhow::Result<Snapshot> {
    let mut patterns = Vec::with_capacity(globs.0.len());
    for pattern in &globs.0 {
        let absolute = ctx.resolve_path(pattern);
        ctx.observe(Observable::glob(absolute.as_str())?);
        patterns.push(absolute);
    }

    let root = ctx.build_root().to_path_buf();
    let files = tokio::task::spawn_blocking(move || collect_files(&root, &patterns)).await??;

    let parts: Vec<Digest> = files
        .iter()
        .flat_map(|(path, digest)| [Digest::of(path.as_str()), *digest])
        .collect();

    Ok(Snapshot {
        digest: Digest::combine(&parts),
        files,
    })
}

fn collect_files(root: &Utf8Path, patterns: &[Utf8PathBuf]) -> anyhow::Result<Vec<(Utf8PathBuf, Digest)>> {
    let mut found = BTreeSet::new();
    for pattern in patterns {
        for entry in glob::glob(pattern.as_str())? {
            let path = Utf8PathBuf::from_path_buf(entry?)
                .map_err(|path| anyhow!("non UTF-8 path {}", path.display()))?;
            if path.is_file() {
                found.insert(path);
            }
        }
    }

    found
        .into_iter()
        .map(|path| {
            let digest = Digest::hash_file(&path).with_context(|| format!("failed to hash {path}"))?;
            let path = match path.strip_prefix(root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => path,
            };
            Ok((path, digest))
        })
        .collect()
}

async fn run_process(ctx: RuleContext, (process,): (Process,)) -> anyhow::Result<ProcessResult> {
    let Some((program, args)) = process.argv.split_first() else {
        bail!("process has an empty argv");
    };

    let cwd = match &process.cwd {
        Some(cwd) => ctx.resolve_path(cwd),
        None => ctx.build_root().to_path_buf(),
    };

    let label = process.label();
    tracing::debug!("running {}", label);

    let child = tokio::process::Command::new(program)
        .args(args)
        .envs(&process.env)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn '{label}'"))?;

    let deadline = async {
        match process.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    // Dropping the child on the losing branches kills it.
    let output = tokio::select! {
        output = child.wait_with_output() => output.with_context(|| format!("failed to wait for '{label}'"))?,
        _ = ctx.cancelled() => return Err(Failure::cancelled().into()),
        _ = deadline => bail!("'{label}' timed out after {:?}", process.timeout.unwrap_or_default()),
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout_digest = Digest::hash(&output.stdout);
    let stderr_digest = Digest::hash(&output.stderr);

    Ok(ProcessResult {
        exit_code,
        stdout: output.stdout.into(),
        stderr: output.stderr.into(),
        stdout_digest,
        stderr_digest,
        output_digest: Digest::combine(&[stdout_digest, stderr_digest, Digest::of(&exit_code)]),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{Request, Scheduler, SchedulerConfig};

    /// A fresh directory under the system temp dir.
    pub(crate) fn temp_dir(name: &str) -> Utf8PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let dir = std::env::temp_dir().join(format!(
            "tsumiki-{}-{}-{}",
            name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Utf8PathBuf::from_path_buf(dir).unwrap()
    }

    fn scheduler(root: &Utf8Path) -> Scheduler {
        let mut rules = RuleSet::new();
        rules.with_intrinsics().unwrap();
        let graph = rules.build().unwrap();
        Scheduler::new(graph, SchedulerConfig::new().build_root(root)).unwrap()
    }

    #[test]
    fn test_read_file_resolves_against_build_root() {
        let root = temp_dir("read");
        std::fs::write(root.join("a.txt"), "hello").unwrap();
        let scheduler = scheduler(&root);
        let session = scheduler.default_session();

        let content: FileContent = scheduler
            .product(&session, FilePath::new("a.txt"))
            .unwrap();
        assert_eq!(content.as_str(), Some("hello"));
        assert_eq!(content.path, root.join("a.txt"));
        assert_eq!(content.digest, Digest::hash(b"hello"));
    }

    #[test]
    fn test_read_file_reports_missing_files() {
        let root = temp_dir("missing");
        let scheduler = scheduler(&root);
        let session = scheduler.default_session();

        let failure = scheduler
            .product::<FileContent, _>(&session, FilePath::new("nope.txt"))
            .unwrap_err();
        assert!(failure.to_string().contains("failed to read"));
    }

    #[test]
    fn test_snapshot_lists_and_tracks_new_files() {
        let root = temp_dir("snapshot");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/a.rs"), "a").unwrap();
        std::fs::write(root.join("src/b.md"), "b").unwrap();
        let scheduler = scheduler(&root);

        let globs = PathGlobs::new(["src/*.rs"]);
        let first: Snapshot = scheduler
            .product(&scheduler.default_session(), globs.clone())
            .unwrap();
        assert_eq!(first.paths().collect::<Vec<_>>(), vec![Utf8Path::new("src/a.rs")]);

        std::fs::write(root.join("src/c.rs"), "c").unwrap();
        let result = scheduler.invalidate_paths(["src/c.rs"]);
        assert_eq!(result.cleared, 1);

        let second: Snapshot = scheduler.product(&scheduler.default_session(), globs).unwrap();
        assert_eq!(second.files.len(), 2);
        assert_ne!(first.digest, second.digest);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_process_captures_output() {
        let root = temp_dir("process");
        let scheduler = scheduler(&root);
        let session = scheduler.default_session();

        let process = Process::new(["sh", "-c", "echo out; echo err >&2; exit 3"]);
        let result: ProcessResult = scheduler.product(&session, process).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout_str(), Some("out\n"));
        assert_eq!(&*result.stderr, b"err\n");
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_process_reruns_for_new_inputs() {
        let root = temp_dir("inputs");
        let scheduler = scheduler(&root);
        let append = |digest: Digest| {
            Process::new(["sh", "-c", "echo run >> runs.txt"]).input_digest(digest)
        };

        for digest in [Digest::hash(b"v1"), Digest::hash(b"v1"), Digest::hash(b"v2")] {
            let result: ProcessResult = scheduler
                .product(&scheduler.default_session(), append(digest))
                .unwrap();
            assert!(result.success());
        }

        let runs = std::fs::read_to_string(root.join("runs.txt")).unwrap();
        assert_eq!(runs.lines().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_process_times_out() {
        let root = temp_dir("timeout");
        let scheduler = scheduler(&root);
        let session = scheduler.default_session();

        let process = Process::new(["sleep", "5"]).timeout(Duration::from_millis(50));
        let results = scheduler.execute(&session, vec![Request::of::<ProcessResult>(process)]);
        let failure = results[0].as_ref().unwrap_err();
        assert!(failure.to_string().contains("timed out"));
    }
}
