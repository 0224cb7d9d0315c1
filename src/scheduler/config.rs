use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::scheduler::TelemetrySink;

/// Construction-time settings of a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Threads of the async runtime driving nodes. `None` uses the number of
    /// cores.
    pub worker_threads: Option<usize>,
    /// Threads of the pool running pure rule bodies. `None` uses the number
    /// of cores.
    pub cpu_threads: Option<usize>,
    /// Shards of the node table and of the invalidation index.
    pub shards: usize,
    /// Relative paths seen by intrinsics and invalidation resolve against
    /// this directory.
    pub build_root: Utf8PathBuf,
    /// Quiet period of the file watcher.
    pub debounce: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let build_root = std::env::current_dir()
            .ok()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("."));

        Self {
            worker_threads: None,
            cpu_threads: None,
            shards: 64,
            build_root,
            debounce: Duration::from_millis(250),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    pub fn cpu_threads(mut self, threads: usize) -> Self {
        self.cpu_threads = Some(threads.max(1));
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn build_root(mut self, root: impl AsRef<Utf8Path>) -> Self {
        self.build_root = root.as_ref().to_path_buf();
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Settings of a single [`Session`](crate::Session).
#[derive(Clone)]
pub struct SessionOptions {
    /// Maximum number of rule bodies running at once.
    pub concurrency: usize,
    /// Free-form identifier attached to the session, e.g. a CI job name.
    pub build_id: Option<String>,
    /// Show a progress bar while root requests run.
    pub progress: bool,
    pub telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
            build_id: None,
            progress: false,
            telemetry: None,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = Some(build_id.into());
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("concurrency", &self.concurrency)
            .field("build_id", &self.build_id)
            .field("progress", &self.progress)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}
