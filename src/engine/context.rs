use std::any::type_name;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::OwnedSemaphorePermit;

use crate::core::lock;
use crate::engine::{Core, Entry, NodeKey, Target};
use crate::error::{ExecutionError, Failure};
use crate::invalidation::Observable;
use crate::rules::GetDecl;
use crate::scheduler::Session;
use crate::types::{Product, Value};

/// Handle given to asynchronous rule bodies.
///
/// Through it a body can request further products with [`get`](Self::get),
/// declare what it reads from the outside world with
/// [`observe`](Self::observe), and check whether its session was cancelled.
#[derive(Clone)]
pub struct RuleContext(Arc<ContextInner>);

struct ContextInner {
    core: Arc<Core>,
    session: Session,
    entry: Arc<Entry>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

enum Started {
    Ready(Value),
    Running(NodeKey, Arc<Entry>),
}

impl RuleContext {
    pub(crate) fn new(
        core: Arc<Core>,
        session: Session,
        entry: Arc<Entry>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self(Arc::new(ContextInner {
            core,
            session,
            entry,
            permit: Mutex::new(Some(permit)),
        }))
    }

    /// The node this body is computing.
    pub fn node(&self) -> &NodeKey {
        self.0.entry.key()
    }

    /// Requests `P` given `subject`, plus the params of the current node.
    ///
    /// The rule must have declared `get::<P, S>()`. While waiting, the body
    /// gives up its concurrency slot so that the dependency can run.
    pub async fn get<P: Product, S: Product>(&self, subject: S) -> Result<P, Failure> {
        let started = self.start::<P, S>(subject)?;
        let mut values = self.finish(vec![started]).await?;
        let value = values
            .pop()
            .ok_or_else(|| Failure::internal("a Get produced no value"))?;
        downcast(value)
    }

    /// Requests `P` for each subject concurrently. Results are in the order
    /// of the subjects; the first failure wins.
    pub async fn get_all<P, S, I>(&self, subjects: I) -> Result<Vec<P>, Failure>
    where
        P: Product,
        S: Product,
        I: IntoIterator<Item = S>,
    {
        let started = subjects
            .into_iter()
            .map(|subject| self.start::<P, S>(subject))
            .collect::<Result<Vec<_>, _>>()?;

        self.finish(started)
            .await?
            .into_iter()
            .map(downcast)
            .collect()
    }

    /// Declares a dependency on something outside the graph. Call this
    /// before reading it, so that a change racing with the read still
    /// invalidates this node.
    pub fn observe(&self, observable: Observable) {
        self.0.entry.observe(observable, self.0.core.graph.index());
    }

    /// Resolves `path` against the build root and observes it.
    pub fn observe_path(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        let path = self.resolve_path(path);
        self.observe(Observable::Path(path.clone()));
        path
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.session.is_cancelled()
    }

    /// Completes once the session is cancelled.
    pub async fn cancelled(&self) {
        self.0.session.cancelled().await
    }

    pub fn build_root(&self) -> &Utf8Path {
        &self.0.core.build_root
    }

    /// Makes `path` absolute, relative to the build root.
    pub fn resolve_path(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.0.core.resolve_path(path.as_ref())
    }

    pub fn session_id(&self) -> u64 {
        self.0.session.id()
    }

    pub fn build_id(&self) -> &str {
        self.0.session.build_id()
    }

    fn start<P: Product, S: Product>(&self, subject: S) -> Result<Started, Failure> {
        let core = &self.0.core;
        let key = self.0.entry.key();

        let undeclared = || {
            Failure::new(ExecutionError::UndeclaredGet {
                rule: key.rule().to_string(),
                product: crate::types::short_name(type_name::<P>()),
                subject: crate::types::short_name(type_name::<S>()),
            })
        };

        let registry = core.rules.registry();
        let decl = match (registry.key_of::<P>(), registry.key_of::<S>()) {
            (Ok(product), Ok(subject)) => GetDecl { product, subject },
            _ => return Err(undeclared()),
        };

        let (resolved, _) = core
            .rules
            .resolved(key.entry())
            .ok_or_else(|| Failure::internal("a param entry issued a Get"))?;
        let target = resolved.get(&decl).ok_or_else(undeclared)?;

        let scope = key.scope_with(decl.subject, Value::new(subject));
        match core.target(target, &scope)? {
            Target::Param(value) => Ok(Started::Ready(value)),
            Target::Node(dep) => {
                let entry = core.launch(&self.0.session, Some(self.0.entry.as_ref()), &dep)?;
                Ok(Started::Running(dep, entry))
            }
        }
    }

    async fn finish(&self, started: Vec<Started>) -> Result<Vec<Value>, Failure> {
        let waiting = started
            .iter()
            .any(|started| matches!(started, Started::Running(..)));
        if waiting {
            drop(lock(&self.0.permit).take());
        }

        let core = &self.0.core;
        let session = &self.0.session;
        let parent = Some(self.0.entry.as_ref());

        let mut values = Vec::with_capacity(started.len());
        for started in started {
            values.push(match started {
                Started::Ready(value) => value,
                Started::Running(dep, entry) => core.wait(session, parent, &dep, entry).await?,
            });
        }

        if waiting {
            let permit = session.acquire().await?;
            *lock(&self.0.permit) = Some(permit);
        }

        Ok(values)
    }
}

fn downcast<P: Product>(value: Value) -> Result<P, Failure> {
    value.downcast::<P>().ok_or_else(|| {
        Failure::internal(format!(
            "expected {} but a Get produced {}",
            type_name::<P>(),
            value.type_name()
        ))
    })
}
