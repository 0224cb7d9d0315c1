use std::fmt::Write;
use std::sync::Arc;

use console::style;
use thiserror::Error;

use crate::core::ArcStr;

/// Errors raised by the [`TypeRegistry`](crate::TypeRegistry).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("type identity '{name}' is already bound to {existing}, cannot bind it to {incoming}")]
    DuplicateType {
        name: String,
        existing: String,
        incoming: String,
    },

    #[error("unknown type '{0}', it was never registered")]
    UnknownType(String),
}

/// A single problem found while solving the rule graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SolveError {
    #[error("no rule chain can compute {product} given ({params}){reason}")]
    UnsatisfiableRule {
        product: String,
        params: String,
        reason: String,
    },

    #[error("ambiguous rules to compute {product} given ({params}):\n    {}", candidates.join("\n    "))]
    AmbiguousRule {
        product: String,
        params: String,
        candidates: Vec<String>,
    },
}

/// Fatal errors raised while turning a [`RuleSet`](crate::RuleSet) into a
/// [`RuleGraph`](crate::RuleGraph). These are reported once, at startup.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("rule name '{0}' is registered more than once")]
    DuplicateRule(String),

    #[error("rule graph is invalid:\n{}", render_solve_errors(.0))]
    Rules(Vec<SolveError>),
}

impl GraphError {
    /// The individual solver errors, if this is a solver failure.
    pub fn solve_errors(&self) -> &[SolveError] {
        match self {
            GraphError::Rules(errors) => errors,
            _ => &[],
        }
    }
}

fn render_solve_errors(errors: &[SolveError]) -> String {
    let mut out = String::new();
    for error in errors {
        let _ = writeln!(out, "  - {error}");
    }
    out
}

/// Errors raised while constructing a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to build the async runtime")]
    Runtime(#[from] std::io::Error),

    #[error("Failed to build the CPU pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// What went wrong while computing a node.
#[derive(Debug, Error, Clone)]
pub enum ExecutionError {
    #[error(transparent)]
    RuleBody(Arc<anyhow::Error>),

    #[error("dependency cycle detected:\n    {}", .0.join("\n    -> "))]
    Cycle(Vec<String>),

    #[error("the session was cancelled")]
    Cancelled,

    #[error("the node was invalidated while it ran")]
    Invalidated,

    #[error("{0}")]
    NoQuery(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("rule '{rule}' did not declare a Get for {product} given {subject}")]
    UndeclaredGet {
        rule: String,
        product: String,
        subject: String,
    },

    #[error("rule body panicked: {0}")]
    Panicked(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    fn label(&self) -> &'static str {
        match self {
            ExecutionError::RuleBody(_) => "RuleBodyError",
            ExecutionError::Cycle(_) => "CycleError",
            ExecutionError::Cancelled => "CancelledError",
            ExecutionError::Invalidated => "InvalidatedError",
            ExecutionError::NoQuery(_) => "QueryError",
            ExecutionError::Registry(_) => "RegistryError",
            ExecutionError::UndeclaredGet { .. } => "UndeclaredGetError",
            ExecutionError::Panicked(_) => "PanicError",
            ExecutionError::Internal(_) => "InternalError",
        }
    }
}

/// The failed outcome of a node or a root request.
///
/// A `Failure` is cheap to clone so that it can be memoized and handed to
/// every dependent. As it propagates upward each dependent adds a frame to
/// its trace, so the rendered failure shows the causal chain of rule
/// invocations from the root request down to the node that actually failed.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct Failure {
    error: ExecutionError,
    /// Innermost frame first.
    trace: Vec<ArcStr>,
}

impl Failure {
    pub fn new(error: ExecutionError) -> Self {
        Self {
            error,
            trace: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ExecutionError::Cancelled)
    }

    pub(crate) fn invalidated() -> Self {
        Self::new(ExecutionError::Invalidated)
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::new(ExecutionError::Internal(msg.into()))
    }

    /// Wraps this failure with the context of a dependent.
    pub fn within(mut self, frame: impl Into<ArcStr>) -> Self {
        self.trace.push(frame.into());
        self
    }

    pub fn error(&self) -> &ExecutionError {
        &self.error
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, ExecutionError::Cancelled)
    }

    /// Whether the node was cleaned while it ran. Waiters retry such nodes.
    pub fn is_invalidated(&self) -> bool {
        matches!(self.error, ExecutionError::Invalidated)
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self.error, ExecutionError::Cycle(_))
    }

    /// Frames from the root request down to the failing node.
    pub fn trace(&self) -> impl Iterator<Item = &str> {
        self.trace.iter().rev().map(AsRef::as_ref)
    }

    /// Renders the engine traceback followed by the error itself.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", style("Engine traceback:").dim());
        for frame in self.trace() {
            let _ = writeln!(out, "  in {frame}");
        }
        let _ = write!(out, "{}: {}", style(self.error.label()).red(), self.error);
        out
    }
}

impl From<ExecutionError> for Failure {
    fn from(error: ExecutionError) -> Self {
        Failure::new(error)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        // Failures of dependencies travel through rule bodies as anyhow errors;
        // unwrap them so their kind and trace survive.
        match error.downcast::<Failure>() {
            Ok(failure) => failure,
            Err(error) => Failure::new(ExecutionError::RuleBody(Arc::new(error))),
        }
    }
}
