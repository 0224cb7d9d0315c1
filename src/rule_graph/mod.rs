//! The solved, immutable rule graph.
//!
//! Solving happens once, in [`RuleSet::build`](crate::RuleSet::build). The
//! result maps every `(product, params in scope)` requirement reachable from a
//! query to exactly one [`Entry`], which is either a root param or a rule whose
//! own inputs and Gets point to further entries.

mod builder;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use crate::error::{ExecutionError, GraphError};
use crate::rules::{GetDecl, Query, Rule, RuleId, display_params};
use crate::types::{TypeKey, TypeRegistry};

/// Index of an entry within a [`RuleGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef(pub(crate) usize);

/// How a requirement is satisfied.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Satisfied directly by a param in scope.
    Param(TypeKey),
    Rule(ResolvedRule),
}

/// A rule chosen for a requirement, with its dependencies resolved.
#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub(crate) rule: RuleId,
    /// One entry per declared input, in declaration order.
    pub(crate) inputs: Vec<EntryRef>,
    pub(crate) gets: BTreeMap<GetDecl, EntryRef>,
}

impl ResolvedRule {
    pub fn rule(&self) -> RuleId {
        self.rule
    }

    pub fn inputs(&self) -> &[EntryRef] {
        &self.inputs
    }

    pub fn get(&self, decl: &GetDecl) -> Option<EntryRef> {
        self.gets.get(decl).copied()
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) product: TypeKey,
    pub(crate) scope: BTreeSet<TypeKey>,
    /// The params this entry transitively consumes; a subset of `scope`.
    pub(crate) used: BTreeSet<TypeKey>,
    pub(crate) resolution: Resolution,
}

impl Entry {
    pub fn product(&self) -> TypeKey {
        self.product
    }

    pub fn scope(&self) -> &BTreeSet<TypeKey> {
        &self.scope
    }

    pub fn used_params(&self) -> &BTreeSet<TypeKey> {
        &self.used
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }
}

/// Statically validated mapping from requirements to the rules computing
/// them. Immutable once built, and shared by the scheduler and every session.
pub struct RuleGraph {
    registry: TypeRegistry,
    rules: Vec<Rule>,
    entries: Vec<Entry>,
    roots: BTreeMap<Query, EntryRef>,
    unreachable: Vec<RuleId>,
}

impl std::fmt::Debug for RuleGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleGraph")
            .field("rules", &self.rules.iter().map(Rule::name).collect::<Vec<_>>())
            .field("entries", &self.entries.len())
            .field("queries", &self.roots.keys().collect::<Vec<_>>())
            .field("unreachable", &self.unreachable)
            .finish()
    }
}

impl RuleGraph {
    pub(crate) fn solve(
        registry: TypeRegistry,
        rules: Vec<Rule>,
        queries: BTreeSet<Query>,
    ) -> Result<Self, GraphError> {
        let solution = builder::solve(&rules, &queries).map_err(GraphError::Rules)?;

        for id in &solution.unreachable {
            tracing::warn!("rule {} is not reachable from any query", rules[id.0]);
        }

        tracing::debug!(
            "solved rule graph with {} rules, {} queries and {} entries",
            rules.len(),
            solution.roots.len(),
            solution.entries.len()
        );

        Ok(Self {
            registry,
            rules,
            entries: solution.entries,
            roots: solution.roots.into_iter().collect(),
            unreachable: solution.unreachable,
        })
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0]
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entry(&self, entry: EntryRef) -> &Entry {
        &self.entries[entry.0]
    }

    pub fn queries(&self) -> impl Iterator<Item = (&Query, EntryRef)> {
        self.roots.iter().map(|(query, entry)| (query, *entry))
    }

    /// Rules that no query can ever reach.
    pub fn unreachable_rules(&self) -> impl Iterator<Item = &Rule> {
        self.unreachable.iter().map(|id| self.rule(*id))
    }

    /// Finds the entry for a root request of `product` given values of the
    /// `params` types.
    ///
    /// A query matching exactly is preferred. Otherwise, a unique query whose
    /// params are a subset of the given ones is used, and the extra values
    /// are ignored.
    pub fn find_root(
        &self,
        product: TypeKey,
        params: &BTreeSet<TypeKey>,
    ) -> Result<EntryRef, ExecutionError> {
        let exact = Query {
            product,
            params: params.clone(),
        };

        if let Some(entry) = self.roots.get(&exact) {
            return Ok(*entry);
        }

        let subsets: Vec<_> = self
            .roots
            .iter()
            .filter(|(query, _)| query.product == product && query.params.is_subset(params))
            .collect();

        match subsets.as_slice() {
            [(_, entry)] => Ok(**entry),
            [] => Err(ExecutionError::NoQuery(format!(
                "no query was registered that computes {} given ({})",
                product,
                display_params(params)
            ))),
            many => Err(ExecutionError::NoQuery(format!(
                "more than one query can compute {} given ({}): {}",
                product,
                display_params(params),
                many.iter()
                    .map(|(query, _)| query.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    pub(crate) fn resolved(&self, entry: EntryRef) -> Option<(&ResolvedRule, &Rule)> {
        match &self.entry(entry).resolution {
            Resolution::Rule(resolved) => Some((resolved, self.rule(resolved.rule))),
            Resolution::Param(_) => None,
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('"', "\\\"")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl Display for RuleGraph {
    /// Renders the solved graph as a Mermaid diagram. Solid edges are
    /// inputs, dotted edges are Gets.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (i, (query, root)) in self.roots.iter().enumerate() {
            writeln!(f, "    q{}{{\"{}\"}}", i, escape(&query.to_string()))?;
            writeln!(f, "    q{} --> e{}", i, root.0)?;
        }

        for (i, entry) in self.entries.iter().enumerate() {
            match &entry.resolution {
                Resolution::Param(product) => {
                    writeln!(f, "    e{}([\"{}\"])", i, escape(&product.to_string()))?;
                }
                Resolution::Rule(resolved) => {
                    let rule = self.rule(resolved.rule);
                    writeln!(f, "    e{}[\"{}\"]", i, escape(&rule.to_string()))?;

                    for (input, dep) in rule.inputs().iter().zip(&resolved.inputs) {
                        writeln!(f, "    e{} -- \"{}\" --> e{}", i, escape(&input.to_string()), dep.0)?;
                    }

                    for (get, dep) in &resolved.gets {
                        writeln!(f, "    e{} -. \"{}\" .-> e{}", i, escape(&get.to_string()), dep.0)?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuleSet;
    use crate::error::SolveError;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Name(String);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Uppercased(String);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Greeting(String);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Verbose(bool);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Missing;

    fn greeting_rules() -> RuleSet {
        let mut rules = RuleSet::new();
        rules
            .rule()
            .name("uppercase")
            .inputs::<(Name,)>()
            .run(|(name,)| Ok(Uppercased(name.0.to_uppercase())))
            .unwrap();
        rules
            .rule()
            .name("greeting")
            .inputs::<(Name,)>()
            .get::<Uppercased, Name>()
            .run_async(|ctx, (name,)| async move {
                let upper: Uppercased = ctx.get(name).await?;
                Ok(Greeting(format!("HELLO {}", upper.0)))
            })
            .unwrap();
        rules
    }

    fn key<T: 'static>(graph: &RuleGraph) -> TypeKey {
        graph.registry().key_of::<T>().unwrap()
    }

    #[test]
    fn test_greeting_resolves() {
        let mut rules = greeting_rules();
        rules.query::<Greeting>().param::<Name>().register().unwrap();
        let graph = rules.build().unwrap();

        let params = BTreeSet::from([key::<Name>(&graph)]);
        let root = graph.find_root(key::<Greeting>(&graph), &params).unwrap();
        let (resolved, rule) = graph.resolved(root).unwrap();

        assert_eq!(rule.name(), "greeting");
        assert_eq!(graph.entry(root).used_params(), &params);

        let get = GetDecl {
            product: key::<Uppercased>(&graph),
            subject: key::<Name>(&graph),
        };
        let upper = resolved.get(&get).unwrap();
        assert_eq!(graph.resolved(upper).unwrap().1.name(), "uppercase");
        assert!(matches!(
            graph.entry(resolved.inputs()[0]).resolution(),
            Resolution::Param(_)
        ));
        assert_eq!(graph.unreachable_rules().count(), 0);

        let debug = format!("{graph:?}");
        assert!(debug.starts_with("RuleGraph"));
        assert!(debug.contains("\"greeting\""));
    }

    #[test]
    fn test_unused_params_are_dropped() {
        let mut rules = greeting_rules();
        rules
            .query::<Greeting>()
            .param::<Name>()
            .param::<Verbose>()
            .register()
            .unwrap();
        let graph = rules.build().unwrap();

        let params = BTreeSet::from([key::<Name>(&graph), key::<Verbose>(&graph)]);
        let root = graph.find_root(key::<Greeting>(&graph), &params).unwrap();
        assert_eq!(
            graph.entry(root).used_params(),
            &BTreeSet::from([key::<Name>(&graph)])
        );
    }

    #[test]
    fn test_ambiguous_rules_fail() {
        let mut rules = RuleSet::new();
        for name in ["first", "second"] {
            rules
                .rule()
                .name(name)
                .inputs::<(Name,)>()
                .run(|(name,)| Ok(Uppercased(name.0)))
                .unwrap();
        }
        rules.query::<Uppercased>().param::<Name>().register().unwrap();

        let err = rules.build().unwrap_err();
        let errors = err.solve_errors();
        assert_eq!(errors.len(), 1);
        let SolveError::AmbiguousRule { candidates, .. } = &errors[0] else {
            panic!("expected an ambiguity, got {err}");
        };
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_unsatisfiable_rules_fail() {
        let mut rules = RuleSet::new();
        rules
            .rule()
            .name("needs_missing")
            .inputs::<(Missing,)>()
            .run(|(_,)| Ok(Uppercased(String::new())))
            .unwrap();
        rules.query::<Uppercased>().param::<Name>().register().unwrap();

        let err = rules.build().unwrap_err();
        assert!(matches!(
            &err.solve_errors()[0],
            SolveError::UnsatisfiableRule { reason, .. } if reason.contains("needs_missing")
        ));
    }

    #[test]
    fn test_all_errors_are_collected() {
        let mut rules = RuleSet::new();
        rules.query::<Uppercased>().param::<Name>().register().unwrap();
        rules.query::<Greeting>().param::<Name>().register().unwrap();

        let err = rules.build().unwrap_err();
        assert_eq!(err.solve_errors().len(), 2);
    }

    #[test]
    fn test_dead_candidates_are_pruned() {
        let mut rules = RuleSet::new();
        rules
            .rule()
            .name("from_missing")
            .inputs::<(Missing,)>()
            .run(|(_,)| Ok(Uppercased(String::new())))
            .unwrap();
        rules
            .rule()
            .name("from_name")
            .inputs::<(Name,)>()
            .run(|(name,)| Ok(Uppercased(name.0)))
            .unwrap();
        rules.query::<Uppercased>().param::<Name>().register().unwrap();

        let graph = rules.build().unwrap();
        let params = BTreeSet::from([key::<Name>(&graph)]);
        let root = graph.find_root(key::<Uppercased>(&graph), &params).unwrap();
        assert_eq!(graph.resolved(root).unwrap().1.name(), "from_name");
        assert_eq!(
            graph.unreachable_rules().map(Rule::name).collect::<Vec<_>>(),
            vec!["from_missing"]
        );
    }

    #[test]
    fn test_params_shadow_rules() {
        let mut rules = RuleSet::new();
        rules
            .rule()
            .name("default_name")
            .inputs::<(Verbose,)>()
            .run(|(_,)| Ok(Name(String::from("default"))))
            .unwrap();
        rules
            .rule()
            .name("uppercase")
            .inputs::<(Name,)>()
            .run(|(name,)| Ok(Uppercased(name.0)))
            .unwrap();
        rules
            .query::<Uppercased>()
            .param::<Name>()
            .param::<Verbose>()
            .register()
            .unwrap();

        let graph = rules.build().unwrap();
        let params = BTreeSet::from([key::<Name>(&graph), key::<Verbose>(&graph)]);
        let root = graph.find_root(key::<Uppercased>(&graph), &params).unwrap();
        let (resolved, _) = graph.resolved(root).unwrap();
        assert!(matches!(
            graph.entry(resolved.inputs()[0]).resolution(),
            Resolution::Param(_)
        ));
    }

    #[test]
    fn test_recursive_get_is_accepted() {
        let mut rules = RuleSet::new();
        rules
            .rule()
            .name("recursive")
            .inputs::<(Name,)>()
            .get::<Uppercased, Name>()
            .run_async(|ctx, (name,)| async move { ctx.get::<Uppercased, _>(name).await.map_err(Into::into) })
            .unwrap();
        rules.query::<Uppercased>().param::<Name>().register().unwrap();

        assert!(rules.build().is_ok());
    }

    #[test]
    fn test_find_root_by_subset() {
        let mut rules = greeting_rules();
        rules.register::<Verbose>().unwrap();
        rules.query::<Greeting>().param::<Name>().register().unwrap();
        let graph = rules.build().unwrap();

        let params = BTreeSet::from([key::<Name>(&graph), key::<Verbose>(&graph)]);
        assert!(graph.find_root(key::<Greeting>(&graph), &params).is_ok());

        let err = graph
            .find_root(key::<Greeting>(&graph), &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoQuery(_)));
    }

    #[test]
    fn test_display_is_mermaid() {
        let mut rules = greeting_rules();
        rules.query::<Greeting>().param::<Name>().register().unwrap();
        let graph = rules.build().unwrap();

        let text = graph.to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("greeting(Name) -&gt; Greeting"));
        assert!(text.contains("-. \"Get(Uppercased, Name)\" .->"));
    }
}
