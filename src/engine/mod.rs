//! The execution graph and the machinery driving its nodes.
//!
//! Every node runs as its own tokio task. A node first starts all of its
//! input dependencies, then waits for them, then runs its rule body. Pure
//! bodies are shipped to the rayon pool; asynchronous bodies run on the
//! runtime and suspend whenever they issue a `Get`, releasing both their
//! worker thread and their slot in the session's concurrency budget.

mod context;
mod entry;
mod graph;
mod node;

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::Instrument;

use crate::error::{ExecutionError, Failure};
use crate::invalidation::normalize;
use crate::rule_graph::{EntryRef, Resolution, RuleGraph};
use crate::rules::Body;
use crate::scheduler::Session;
use crate::types::{TypeKey, Value};

pub use context::RuleContext;
pub use entry::NodeState;
pub use node::{EntryId, NodeKey};

pub(crate) use entry::Entry;
pub(crate) use graph::Graph;

pub(crate) type NodeResult = Result<Value, Failure>;

/// Scheduler-wide state shared by every session and every node.
pub(crate) struct Core {
    pub rules: RuleGraph,
    pub graph: Graph,
    pub pool: rayon::ThreadPool,
    pub build_root: Utf8PathBuf,
}

/// What a rule graph entry resolves to for concrete params.
pub(crate) enum Target {
    Param(Value),
    Node(NodeKey),
}

/// A dependency which has been started but not yet awaited.
enum Pending {
    Ready(Value),
    Started(NodeKey, Arc<Entry>),
}

impl Core {
    pub fn resolve_path(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.build_root.join(path))
        }
    }

    /// Computes the node key for `entry`, keeping only the params it uses,
    /// or returns the param value directly.
    pub fn target(&self, entry: EntryRef, scope: &[(TypeKey, Value)]) -> Result<Target, Failure> {
        let find = |ty: TypeKey| {
            scope
                .iter()
                .find(|(key, _)| *key == ty)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| Failure::internal(format!("param {ty} is missing from the scope")))
        };

        let node = self.rules.entry(entry);
        match &node.resolution {
            Resolution::Param(ty) => Ok(Target::Param(find(*ty)?)),
            Resolution::Rule(resolved) => {
                let rule = self.rules.rule(resolved.rule);
                let params = node
                    .used
                    .iter()
                    .map(|ty| Ok((*ty, find(*ty)?)))
                    .collect::<Result<Vec<_>, Failure>>()?;
                Ok(Target::Node(NodeKey::new(entry, rule.name(), params)))
            }
        }
    }

    /// Gets or creates the node for `key`, records the edge from `parent`
    /// and makes sure the node is running for this session.
    pub fn launch(
        self: &Arc<Self>,
        session: &Session,
        parent: Option<&Entry>,
        key: &NodeKey,
    ) -> Result<Arc<Entry>, Failure> {
        loop {
            if session.is_cancelled() {
                return Err(Failure::cancelled());
            }

            let entry = self.graph.get_or_create(key);

            if let Some(parent) = parent {
                self.graph.add_dependency(parent.key(), key)?;
            }

            // Lost a race with invalidation; the next lookup sees a fresh entry.
            if entry.is_cleaned() {
                continue;
            }

            if entry.try_start(session.id()) {
                tokio::spawn(run_node(self.clone(), session.clone(), entry.clone()));
            }

            return Ok(entry);
        }
    }

    /// Waits for a launched node.
    ///
    /// A node which was invalidated while it ran, or which was started by
    /// another session that was then cancelled, reports that to every
    /// waiter instead of a result. While this session is live such a node
    /// is launched again. A parent waiting on an uncacheable node becomes
    /// uncacheable itself.
    pub async fn wait(
        self: &Arc<Self>,
        session: &Session,
        parent: Option<&Entry>,
        key: &NodeKey,
        mut entry: Arc<Entry>,
    ) -> NodeResult {
        loop {
            let result = tokio::select! {
                result = entry.wait() => result,
                _ = session.cancelled() => Err(Failure::cancelled()),
            };

            match result {
                Err(failure) if failure.is_cancelled() || failure.is_invalidated() => {
                    if session.is_cancelled() {
                        return Err(Failure::cancelled());
                    }
                    tracing::debug!("restarting {} after {}", key, failure);
                    entry = self.launch(session, parent, key)?;
                }
                result => {
                    if let Some(parent) = parent
                        && entry.is_uncacheable()
                    {
                        parent.mark_uncacheable();
                    }
                    return result;
                }
            }
        }
    }

    async fn execute_node(self: &Arc<Self>, session: &Session, entry: &Arc<Entry>) -> NodeResult {
        let key = entry.key();
        let (resolved, rule) = self
            .rules
            .resolved(key.entry())
            .ok_or_else(|| Failure::internal("a param entry was scheduled as a node"))?;

        if !rule.is_cacheable() {
            entry.mark_uncacheable();
        }

        let mut pending = Vec::with_capacity(resolved.inputs.len());
        for &input in &resolved.inputs {
            pending.push(match self.target(input, key.params())? {
                Target::Param(value) => Pending::Ready(value),
                Target::Node(dep) => {
                    let started = self.launch(session, Some(entry.as_ref()), &dep)?;
                    Pending::Started(dep, started)
                }
            });
        }

        let mut inputs = Vec::with_capacity(pending.len());
        for dep in pending {
            inputs.push(match dep {
                Pending::Ready(value) => value,
                Pending::Started(dep, started) => {
                    self.wait(session, Some(entry.as_ref()), &dep, started).await?
                }
            });
        }

        if session.is_cancelled() {
            return Err(Failure::cancelled());
        }

        let permit = session.acquire().await?;

        match rule.body() {
            Body::Pure(body) => {
                let body = body.clone();
                let (tx, rx) = tokio::sync::oneshot::channel();

                self.pool.spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| body(&inputs)));
                    let _ = tx.send(result);
                });

                let result = rx
                    .await
                    .map_err(|_| Failure::internal("the CPU pool dropped a rule body"))?;
                drop(permit);

                match result {
                    Ok(output) => Ok(output?),
                    Err(panic) => Err(panicked(panic)),
                }
            }
            Body::Async(body) => {
                let body = body.clone();
                let ctx = RuleContext::new(self.clone(), session.clone(), entry.clone(), permit);

                match tokio::spawn(async move { body(ctx, inputs).await }).await {
                    Ok(output) => Ok(output?),
                    Err(err) if err.is_panic() => Err(panicked(err.into_panic())),
                    Err(_) => Err(Failure::cancelled()),
                }
            }
        }
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> Failure {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    };

    Failure::new(ExecutionError::Panicked(msg))
}

/// Drives a node to completion. Boxed, because node futures recursively
/// spawn further node futures.
fn run_node(
    core: Arc<Core>,
    session: Session,
    entry: Arc<Entry>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let key = entry.key().clone();
        let span = tracing::info_span!("node", rule = key.rule());

        let start = Instant::now();
        let result = core
            .execute_node(&session, &entry)
            .instrument(span)
            .await
            .map_err(|failure| failure.within(key.to_string()));
        let duration = start.elapsed();

        match &result {
            Ok(_) => tracing::debug!("completed {} in {:.2?}", key, duration),
            Err(failure) if failure.is_cancelled() => tracing::debug!("cancelled {}", key),
            Err(failure) => tracing::debug!("failed {}: {}", key, failure),
        }

        session.record(&key, start, duration, &result);
        core.graph.complete(&entry, result);
    })
}

/// A key with its own rule graph entry per distinct name.
#[cfg(test)]
pub(crate) fn test_key(name: &str) -> NodeKey {
    let entry = name
        .bytes()
        .fold(17usize, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as usize));
    NodeKey::new(EntryRef(entry), name, Vec::new())
}
