use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

use crate::core::lock;
use crate::engine::{NodeKey, NodeResult};
use crate::error::Failure;
use crate::scheduler::SessionOptions;
use crate::scheduler::diagnostics::{Diagnostics, NodeExecution, Outcome};

/// A node run, as reported to a [`TelemetrySink`].
#[derive(Debug)]
pub struct NodeEvent<'a> {
    pub session: u64,
    pub node: &'a NodeKey,
    pub duration: Duration,
    pub outcome: Outcome,
    pub failure: Option<&'a Failure>,
}

/// Receives an event for every node run in a session.
///
/// Called from runtime worker threads; implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn node_completed(&self, event: &NodeEvent<'_>);
}

/// A unit of client work against a [`Scheduler`](crate::Scheduler).
///
/// Sessions share the memoized graph. Each one has its own cancellation
/// flag, concurrency budget, root set and telemetry. Cloning a session is
/// cheap and yields a handle to the same session.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

struct SessionInner {
    id: u64,
    build_id: String,
    concurrency: usize,
    cancel: watch::Sender<bool>,
    semaphore: Arc<Semaphore>,
    roots: Mutex<Vec<NodeKey>>,
    diagnostics: Mutex<Diagnostics>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    progress: bool,
    created: Instant,
}

impl Session {
    pub(crate) fn new(id: u64, options: SessionOptions) -> Self {
        let concurrency = options.concurrency.max(1);
        Self(Arc::new(SessionInner {
            id,
            build_id: options.build_id.unwrap_or_else(|| format!("session-{id}")),
            concurrency,
            cancel: watch::Sender::new(false),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            roots: Mutex::default(),
            diagnostics: Mutex::default(),
            telemetry: options.telemetry,
            progress: options.progress,
            created: Instant::now(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn build_id(&self) -> &str {
        &self.0.build_id
    }

    pub fn concurrency(&self) -> usize {
        self.0.concurrency
    }

    /// Cancels every request of this session. Nodes shared with other
    /// sessions are restarted by those sessions if they still need them.
    pub fn cancel(&self) {
        if !self.0.cancel.send_replace(true) {
            tracing::debug!("cancelling session {}", self.0.id);
        }
        self.0.semaphore.close();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.cancel.borrow()
    }

    /// Completes once the session is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.0.cancel.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Takes a slot of the concurrency budget. Fails once cancelled.
    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit, Failure> {
        self.0
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Failure::cancelled())
    }

    pub(crate) fn progress(&self) -> bool {
        self.0.progress
    }

    pub(crate) fn add_root(&self, key: NodeKey) {
        let mut roots = lock(&self.0.roots);
        if !roots.contains(&key) {
            roots.push(key);
        }
    }

    /// The node keys of every root request made in this session.
    pub fn roots(&self) -> Vec<NodeKey> {
        lock(&self.0.roots).clone()
    }

    pub(crate) fn record(&self, node: &NodeKey, start: Instant, duration: Duration, result: &NodeResult) {
        let failure = result.as_ref().err();
        let outcome = match failure {
            None => Outcome::Completed,
            Some(failure) if failure.is_cancelled() => Outcome::Cancelled,
            Some(_) => Outcome::Failed,
        };

        lock(&self.0.diagnostics).executions.push(NodeExecution {
            node: node.to_string(),
            rule: node.rule().to_string(),
            started_after: start.saturating_duration_since(self.0.created),
            duration,
            outcome,
        });

        if let Some(sink) = &self.0.telemetry {
            sink.node_completed(&NodeEvent {
                session: self.0.id,
                node,
                duration,
                outcome,
                failure,
            });
        }
    }

    /// A snapshot of the nodes run so far.
    pub fn diagnostics(&self) -> Diagnostics {
        lock(&self.0.diagnostics).clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.0.id)
            .field("build_id", &self.0.build_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_key;

    #[test]
    fn test_cancel_closes_the_budget() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let session = Session::new(1, SessionOptions::new().concurrency(1));

        runtime.block_on(async {
            let permit = session.acquire().await.unwrap();
            drop(permit);

            session.cancel();
            session.cancelled().await;
            assert!(session.acquire().await.unwrap_err().is_cancelled());
        });
    }

    #[test]
    fn test_record_feeds_diagnostics_and_sink() {
        struct Counter(Mutex<Vec<Outcome>>);

        impl TelemetrySink for Counter {
            fn node_completed(&self, event: &NodeEvent<'_>) {
                lock(&self.0).push(event.outcome);
            }
        }

        let sink = Arc::new(Counter(Mutex::default()));
        let session = Session::new(2, SessionOptions::new().telemetry(sink.clone()));
        let key = test_key("a");

        session.record(&key, Instant::now(), Duration::from_millis(1), &Err(Failure::cancelled()));
        assert_eq!(session.diagnostics().count(Outcome::Cancelled), 1);
        assert_eq!(*lock(&sink.0), vec![Outcome::Cancelled]);
        assert_eq!(session.build_id(), "session-2");
    }
}
