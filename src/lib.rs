#![forbid(unsafe_code)]
//! A rule-based, memoizing, asynchronous task scheduler for incremental
//! builds.
//!
//! Computation is declared as **rules**: typed functions from input
//! products to an output product, which may additionally request other
//! products at runtime with `Get`. Rules and their entry points (queries)
//! are collected in a [`RuleSet`] and solved once into an immutable
//! [`RuleGraph`], which decides statically which rule provides every product
//! in every context. Construction fails with every unsatisfiable or
//! ambiguous requirement listed, rather than at the first request.
//!
//! A [`Scheduler`] executes root requests against the solved graph. Every
//! concrete application of a rule to param values becomes a memoized node,
//! shared between concurrent callers and reused across sessions until
//! something it observed changes.
//!
//! ```no_run
//! use tsumiki::{RuleContext, RuleSet, Scheduler, SchedulerConfig};
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! struct Name(String);
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! struct Upper(String);
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! struct Greeting(String);
//!
//! let mut rules = RuleSet::new();
//! rules
//!     .rule()
//!     .inputs::<(Name,)>()
//!     .run(|(name,)| Ok(Upper(name.0.to_uppercase())))?;
//! rules
//!     .rule()
//!     .inputs::<(Name,)>()
//!     .get::<Upper, Name>()
//!     .run_async(|ctx: RuleContext, (name,): (Name,)| async move {
//!         let upper = ctx.get::<Upper, Name>(name).await?;
//!         anyhow::Ok(Greeting(format!("HELLO {}", upper.0)))
//!     })?;
//! rules.query::<Greeting>().param::<Name>().register()?;
//!
//! let scheduler = Scheduler::new(rules.build()?, SchedulerConfig::default())?;
//! let session = scheduler.default_session();
//! let greeting: Greeting = scheduler.product(&session, Name("bob".into()))?;
//! assert_eq!(greeting.0, "HELLO BOB");
//! # Ok::<(), anyhow::Error>(())
//! ```

mod core;
mod engine;
mod error;
pub mod intrinsics;
mod invalidation;
#[cfg(feature = "logging")]
pub mod logging;
mod rule_graph;
mod rules;
mod scheduler;
mod types;
#[cfg(feature = "watch")]
pub mod watch;

pub use crate::core::Digest;
pub use crate::engine::{EntryId, NodeKey, NodeState, RuleContext};
pub use crate::error::*;
pub use crate::invalidation::{ChangeEvent, ChangeKind, InvalidationResult, Observable};
pub use crate::rule_graph::{Entry, EntryRef, Resolution, ResolvedRule, RuleGraph};
pub use crate::rules::{GetDecl, Params, Query, QueryDef, Rule, RuleDef, RuleFuture, RuleId, RuleSet};
pub use crate::scheduler::{
    Diagnostics, NodeEvent, NodeExecution, Outcome, Request, Scheduler, SchedulerConfig, Session,
    SessionOptions, TelemetrySink,
};
pub use crate::types::{Product, TypeDescriptor, TypeKey, TypeRegistry, Value};
#[cfg(feature = "watch")]
pub use crate::watch::FileWatcher;
