//! Entry point for clients: sessions, root requests and invalidation.

mod config;
mod diagnostics;
mod session;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8Path;
use indicatif::ProgressStyle;
use tokio::runtime::Runtime;
use tracing::Instrument;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{Core, Graph, NodeKey, NodeResult, NodeState, Target};
use crate::error::{ExecutionError, Failure, RegistryError, SchedulerError};
use crate::invalidation::{ChangeEvent, InvalidationResult};
use crate::rule_graph::RuleGraph;
use crate::types::{Product, TypeKey, TypeRegistry, Value};

pub use config::{SchedulerConfig, SessionOptions};
pub use diagnostics::{Diagnostics, NodeExecution, Outcome};
pub use session::{NodeEvent, Session, TelemetrySink};

/// A root request: a product type plus the values of the params to compute
/// it from.
#[derive(Debug, Clone)]
pub struct Request {
    product: fn(&TypeRegistry) -> Result<TypeKey, RegistryError>,
    product_name: &'static str,
    params: Vec<Value>,
}

impl Request {
    /// A request for `P` without params.
    pub fn new<P: Product>() -> Self {
        Self {
            product: TypeRegistry::key_of::<P>,
            product_name: std::any::type_name::<P>(),
            params: Vec::new(),
        }
    }

    /// A request for `P` given a single subject.
    pub fn of<P: Product>(subject: impl Product) -> Self {
        Self::new::<P>().param(subject)
    }

    pub fn param(mut self, value: impl Product) -> Self {
        self.params.push(Value::new(value));
        self
    }

    /// Adds an already erased param value.
    pub fn value(mut self, value: Value) -> Self {
        self.params.push(value);
        self
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", crate::types::short_name(self.product_name))?;
        for (i, value) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value:?}")?;
        }
        f.write_str(")")
    }
}

/// Executes root requests against a solved [`RuleGraph`], memoizing every
/// node across sessions until it is invalidated.
///
/// Cloning a scheduler is cheap; clones share the graph and the runtimes.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
    runtime: Arc<Runtime>,
    config: Arc<SchedulerConfig>,
    sessions: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(rules: RuleGraph, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let mut runtime = tokio::runtime::Builder::new_multi_thread();
        runtime.enable_all().thread_name("tsumiki-worker");
        if let Some(threads) = config.worker_threads {
            runtime.worker_threads(threads);
        }
        let runtime = runtime.build()?;

        let mut pool = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("tsumiki-cpu-{i}"));
        if let Some(threads) = config.cpu_threads {
            pool = pool.num_threads(threads);
        }
        let pool = pool.build()?;

        tracing::debug!(
            "scheduler ready with {} rules and {} queries",
            rules.rules().len(),
            rules.queries().count()
        );

        let core = Core {
            rules,
            graph: Graph::new(config.shards),
            pool,
            build_root: config.build_root.clone(),
        };

        Ok(Self {
            core: Arc::new(core),
            runtime: Arc::new(runtime),
            config: Arc::new(config),
            sessions: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn rules(&self) -> &RuleGraph {
        &self.core.rules
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// A session running at most `concurrency` rule bodies at once.
    pub fn new_session(&self, concurrency: usize) -> Session {
        self.session(SessionOptions::new().concurrency(concurrency))
    }

    /// A session with default options.
    pub fn default_session(&self) -> Session {
        self.session(SessionOptions::default())
    }

    pub fn session(&self, options: SessionOptions) -> Session {
        let id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        Session::new(id, options)
    }

    /// Runs the requests to completion, blocking the calling thread.
    ///
    /// Results are in request order. A failing request does not affect the
    /// others. Must not be called from within an async context.
    pub fn execute(&self, session: &Session, requests: Vec<Request>) -> Vec<NodeResult> {
        self.runtime.block_on(self.execute_async(session, requests))
    }

    /// Runs the requests on the scheduler's runtime.
    pub async fn execute_async(&self, session: &Session, requests: Vec<Request>) -> Vec<NodeResult> {
        let span = tracing::info_span!("requests", session = session.id());
        if session.progress() {
            span.pb_set_length(requests.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            {
                span.pb_set_style(&style.progress_chars("=>-"));
            }
            span.pb_set_message(session.build_id());
        }

        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let core = self.core.clone();
                let session = session.clone();
                let label = request.to_string();
                let task = async move {
                    root(&core, &session, request)
                        .await
                        .map_err(|failure| failure.within(label))
                };
                self.runtime.spawn(task.instrument(span.clone()))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => Err(Failure::internal("a root request panicked")),
                Err(_) => Err(Failure::cancelled()),
            });
            span.pb_inc(1);
        }
        results
    }

    /// Computes a single `P` given `subject`.
    pub fn product<P: Product, S: Product>(&self, session: &Session, subject: S) -> Result<P, Failure> {
        let result = self
            .execute(session, vec![Request::of::<P>(subject)])
            .pop()
            .ok_or_else(|| Failure::internal("no result for a single request"))??;

        result.downcast::<P>().ok_or_else(|| {
            Failure::internal(format!("root request produced {}", result.type_name()))
        })
    }

    /// Cleans every node that observed one of the changed paths, and every
    /// node that transitively depends on those.
    pub fn handle_invalidation_events(&self, events: &[ChangeEvent]) -> InvalidationResult {
        for event in events {
            tracing::trace!("{:?} {}", event.kind, event.path);
        }
        self.invalidate_paths(events.iter().map(|event| &event.path))
    }

    /// Relative paths resolve against the build root.
    pub fn invalidate_paths<I, P>(&self, paths: I) -> InvalidationResult
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Utf8Path>,
    {
        let paths: Vec<_> = paths
            .into_iter()
            .map(|path| self.core.resolve_path(path.as_ref()))
            .collect();

        let result = self.core.graph.invalidate_paths(&paths);
        if !result.is_empty() {
            tracing::info!(
                "invalidated {} nodes ({} cleared, {} dirtied)",
                result.cleared + result.dirtied,
                result.cleared,
                result.dirtied
            );
        }
        result
    }

    /// Drops memoized nodes not reachable from the roots of the given
    /// sessions. Returns the number of dropped nodes.
    pub fn garbage_collect(&self, live: &[&Session]) -> usize {
        let roots: Vec<NodeKey> = live.iter().flat_map(|session| session.roots()).collect();
        let dropped = self.core.graph.garbage_collect(&roots);
        tracing::debug!("garbage collected {} nodes", dropped);
        dropped
    }

    /// Drops every node.
    pub fn clear(&self) -> usize {
        self.core.graph.clear()
    }

    pub fn node_count(&self) -> usize {
        self.core.graph.len()
    }

    pub fn node_state(&self, key: &NodeKey) -> Option<NodeState> {
        self.core.graph.state(key)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("nodes", &self.node_count())
            .finish()
    }
}

async fn root(core: &Arc<Core>, session: &Session, request: Request) -> NodeResult {
    let registry = core.rules.registry();
    let product = (request.product)(registry).map_err(ExecutionError::from)?;

    let mut scope = Vec::with_capacity(request.params.len());
    let mut types = BTreeSet::new();
    for value in request.params {
        let ty = registry.key_of_value(&value).map_err(ExecutionError::from)?;
        if !types.insert(ty) {
            return Err(ExecutionError::NoQuery(format!(
                "request for {product} has more than one param of type {ty}"
            ))
            .into());
        }
        scope.push((ty, value));
    }

    let entry = core.rules.find_root(product, &types)?;

    match core.target(entry, &scope)? {
        Target::Param(value) => Ok(value),
        Target::Node(key) => {
            session.add_root(key.clone());
            let entry = core.launch(session, None, &key)?;
            core.wait(session, None, &key, entry).await
        }
    }
}
