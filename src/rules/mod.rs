//! Rules, the static building blocks of the engine.
//!
//! A [`Rule`] declares the product type it computes, the types it needs as
//! direct inputs and the `(product, subject)` pairs it may request while it
//! runs. Rules are registered on a [`RuleSet`], which is then solved into an
//! immutable [`RuleGraph`](crate::RuleGraph).

mod builder;
mod params;

use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::engine::RuleContext;
use crate::error::{GraphError, RegistryError};
use crate::rule_graph::RuleGraph;
use crate::types::{Product, TypeKey, TypeRegistry, Value};

pub use builder::{QueryDef, RuleDef};
pub use params::Params;

/// The future returned by a type-erased asynchronous rule body.
pub type RuleFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

pub(crate) type PureFn = dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync;
pub(crate) type AsyncFn = dyn Fn(RuleContext, Vec<Value>) -> RuleFuture + Send + Sync;

/// The computation behind a rule.
#[derive(Clone)]
pub(crate) enum Body {
    /// A plain function of the inputs. Runs on the CPU pool and cannot
    /// request anything.
    Pure(Arc<PureFn>),
    /// A coroutine that may suspend on `Get` requests.
    Async(Arc<AsyncFn>),
}

/// Index of a rule within its [`RuleSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub(crate) usize);

/// A `Get` a rule may issue: compute `product` given a value of `subject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GetDecl {
    pub product: TypeKey,
    pub subject: TypeKey,
}

impl Display for GetDecl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Get({}, {})", self.product, self.subject)
    }
}

pub struct Rule {
    id: RuleId,
    name: Cow<'static, str>,
    named: bool,
    output: TypeKey,
    inputs: Vec<TypeKey>,
    gets: Vec<GetDecl>,
    body: Body,
    cacheable: bool,
}

impl Rule {
    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> TypeKey {
        self.output
    }

    pub fn inputs(&self) -> &[TypeKey] {
        &self.inputs
    }

    pub fn gets(&self) -> &[GetDecl] {
        &self.gets
    }

    /// Uncacheable rules are re-run once per session.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub(crate) fn body(&self) -> &Body {
        &self.body
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{input}")?;
        }
        write!(f, ") -> {}", self.output)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("output", &self.output)
            .field("inputs", &self.inputs)
            .field("gets", &self.gets)
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}

/// An entry point into the rule graph: a product requested given a set of
/// root parameter types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Query {
    pub product: TypeKey,
    pub params: BTreeSet<TypeKey>,
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({} given ({}))", self.product, display_params(&self.params))
    }
}

pub(crate) fn display_params<'a>(params: impl IntoIterator<Item = &'a TypeKey>) -> String {
    params
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The set of rules and queries making up a build system.
///
/// Plugins register their rules here during startup. Once everything is in
/// place, [`RuleSet::build`] consumes the set and solves it.
///
/// # Example
///
/// ```rust,no_run
/// use tsumiki::RuleSet;
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct Name(String);
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct Shout(String);
///
/// let mut rules = RuleSet::new();
/// rules
///     .rule()
///     .name("shout")
///     .inputs::<(Name,)>()
///     .run(|(name,)| Ok(Shout(name.0.to_uppercase())))
///     .unwrap();
/// rules.query::<Shout>().param::<Name>().register().unwrap();
///
/// let graph = rules.build().unwrap();
/// ```
#[derive(Default)]
pub struct RuleSet {
    pub(crate) registry: TypeRegistry,
    pub(crate) rules: Vec<Rule>,
    pub(crate) queries: BTreeSet<Query>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the definition of a new rule.
    pub fn rule(&mut self) -> RuleDef<'_> {
        RuleDef::new(self)
    }

    /// Starts the definition of a query for product `P`.
    pub fn query<P: Product>(&mut self) -> QueryDef<'_> {
        QueryDef::new::<P>(self)
    }

    /// Registers the filesystem and process primitives.
    pub fn with_intrinsics(&mut self) -> Result<&mut Self, RegistryError> {
        crate::intrinsics::register(self)?;
        Ok(self)
    }

    /// Registers a type up front. Types used by rules and queries are
    /// registered automatically.
    pub fn register<T: Product>(&mut self) -> Result<TypeKey, RegistryError> {
        self.registry.register::<T>()
    }

    /// Registers a type under an explicit identity.
    pub fn register_named<T: Product>(&mut self, name: &'static str) -> Result<TypeKey, RegistryError> {
        self.registry.register_named::<T>(name)
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn queries(&self) -> impl Iterator<Item = &Query> {
        self.queries.iter()
    }

    /// Solves the rule graph. Every problem found is reported at once.
    pub fn build(self) -> Result<RuleGraph, GraphError> {
        let mut seen = HashSet::new();
        for rule in self.rules.iter().filter(|rule| rule.named) {
            if !seen.insert(rule.name.as_ref()) {
                return Err(GraphError::DuplicateRule(rule.name.to_string()));
            }
        }

        RuleGraph::solve(self.registry, self.rules, self.queries)
    }

    fn push_rule(&mut self, rule: Rule) -> RuleId {
        let id = rule.id;
        tracing::debug!("registered rule {}", rule);
        self.rules.push(rule);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Name(String);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Shout(String);

    #[test]
    fn test_rule_records_its_shape() {
        let mut rules = RuleSet::new();
        let id = rules
            .rule()
            .name("shout")
            .inputs::<(Name,)>()
            .get::<Shout, Name>()
            .cacheable(false)
            .run(|(name,)| Ok(Shout(name.0)))
            .unwrap();

        let rule = &rules.rules()[id.0];
        let registry = rules.registry();
        assert_eq!(rule.name(), "shout");
        assert_eq!(rule.output(), registry.key_of::<Shout>().unwrap());
        assert_eq!(rule.inputs(), &[registry.key_of::<Name>().unwrap()]);
        assert_eq!(rule.gets().len(), 1);
        assert!(!rule.is_cacheable());
        assert_eq!(rule.to_string(), "shout(Name) -> Shout");
    }

    #[test]
    fn test_pure_body_decodes_inputs() {
        let mut rules = RuleSet::new();
        let id = rules
            .rule()
            .inputs::<(Name,)>()
            .run(|(name,)| Ok(Shout(name.0.to_uppercase())))
            .unwrap();

        let Body::Pure(body) = rules.rules()[id.0].body() else {
            panic!("expected a pure body");
        };

        let out = body(&[Value::new(Name("bob".into()))]).unwrap();
        assert_eq!(out.downcast::<Shout>(), Some(Shout("BOB".into())));
        assert!(body(&[Value::new(1u8)]).is_err());
    }

    #[test]
    fn test_duplicate_rule_names_are_rejected() {
        let mut rules = RuleSet::new();
        for _ in 0..2 {
            rules
                .rule()
                .name("same")
                .inputs::<(Name,)>()
                .run(|(name,)| Ok(Shout(name.0)))
                .unwrap();
        }

        let err = rules.build().unwrap_err();
        assert!(matches!(err, GraphError::DuplicateRule(name) if name == "same"));
    }

    #[test]
    fn test_query_display() {
        let mut rules = RuleSet::new();
        rules.query::<Shout>().param::<Name>().register().unwrap();
        let query = rules.queries().next().unwrap();
        assert_eq!(query.to_string(), "Query(Shout given (Name))");
    }
}
