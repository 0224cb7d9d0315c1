//! Backward-chaining solver turning a set of rules and queries into a
//! resolved graph of entries.
//!
//! The solver works in four passes:
//!
//! 1. **Explore**: starting from every query, enumerate the requirements
//!    `(product, params in scope)` reachable through rule inputs and Gets,
//!    together with their candidate producers.
//! 2. **Prune**: remove candidates that depend on a requirement with no
//!    viable candidate left, repeating until nothing changes. Recursive rules
//!    keep each other alive, so cycles are only rejected at runtime.
//! 3. **Choose**: walk from the queries and require exactly one surviving
//!    candidate per reached requirement. Every failure is collected.
//! 4. **Used params**: compute, for each entry, which root params it
//!    actually consumes, so that node keys carry no unused values.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::SolveError;
use crate::rule_graph::{Entry, EntryRef, Resolution, ResolvedRule};
use crate::rules::{GetDecl, Query, Rule, RuleId, display_params};
use crate::types::TypeKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Requirement {
    product: TypeKey,
    scope: BTreeSet<TypeKey>,
}

enum Candidate {
    Param,
    Rule {
        rule: RuleId,
        inputs: Vec<usize>,
        gets: Vec<(GetDecl, usize)>,
    },
}

impl Candidate {
    fn dependencies(&self) -> impl Iterator<Item = usize> + '_ {
        let (inputs, gets): (&[usize], &[(GetDecl, usize)]) = match self {
            Candidate::Param => (&[], &[]),
            Candidate::Rule { inputs, gets, .. } => (inputs.as_slice(), gets.as_slice()),
        };
        inputs.iter().copied().chain(gets.iter().map(|(_, dep)| *dep))
    }
}

struct Node {
    req: Requirement,
    candidates: Vec<Candidate>,
    alive: Vec<bool>,
}

impl Node {
    fn is_satisfiable(&self) -> bool {
        self.alive.iter().any(|&alive| alive)
    }
}

pub(super) struct Solution {
    pub entries: Vec<Entry>,
    pub roots: Vec<(Query, EntryRef)>,
    pub unreachable: Vec<RuleId>,
}

pub(super) fn solve(rules: &[Rule], queries: &BTreeSet<Query>) -> Result<Solution, Vec<SolveError>> {
    let mut solver = Solver::new(rules);

    let roots: Vec<_> = queries
        .iter()
        .map(|query| {
            let req = Requirement {
                product: query.product,
                scope: query.params.clone(),
            };
            (query.clone(), solver.intern(req))
        })
        .collect();

    solver.explore();
    solver.prune();
    solver.choose(roots)
}

struct Solver<'a> {
    rules: &'a [Rule],
    producers: HashMap<TypeKey, Vec<RuleId>>,
    nodes: Vec<Node>,
    index: HashMap<Requirement, usize>,
    queue: VecDeque<usize>,
}

impl<'a> Solver<'a> {
    fn new(rules: &'a [Rule]) -> Self {
        let mut producers: HashMap<TypeKey, Vec<RuleId>> = HashMap::new();
        for rule in rules {
            producers.entry(rule.output()).or_default().push(rule.id());
        }

        Self {
            rules,
            producers,
            nodes: Vec::new(),
            index: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn intern(&mut self, req: Requirement) -> usize {
        if let Some(&index) = self.index.get(&req) {
            return index;
        }

        let index = self.nodes.len();
        self.nodes.push(Node {
            req: req.clone(),
            candidates: Vec::new(),
            alive: Vec::new(),
        });
        self.index.insert(req, index);
        self.queue.push_back(index);
        index
    }

    fn explore(&mut self) {
        let rules = self.rules;

        while let Some(index) = self.queue.pop_front() {
            let req = self.nodes[index].req.clone();

            // A param in scope shadows every rule producing the same type.
            let candidates = if req.scope.contains(&req.product) {
                vec![Candidate::Param]
            } else {
                let producers = self.producers.get(&req.product).cloned().unwrap_or_default();
                let mut candidates = Vec::with_capacity(producers.len());

                for id in producers {
                    let rule = &rules[id.0];

                    let mut inputs = Vec::with_capacity(rule.inputs().len());
                    for &input in rule.inputs() {
                        inputs.push(self.intern(Requirement {
                            product: input,
                            scope: req.scope.clone(),
                        }));
                    }

                    let mut gets = Vec::with_capacity(rule.gets().len());
                    for &get in rule.gets() {
                        let mut scope = req.scope.clone();
                        scope.insert(get.subject);
                        let dep = self.intern(Requirement {
                            product: get.product,
                            scope,
                        });
                        gets.push((get, dep));
                    }

                    candidates.push(Candidate::Rule {
                        rule: id,
                        inputs,
                        gets,
                    });
                }

                candidates
            };

            let node = &mut self.nodes[index];
            node.alive = vec![true; candidates.len()];
            node.candidates = candidates;
        }
    }

    fn prune(&mut self) {
        let mut rounds = 0;

        loop {
            let mut changed = false;
            rounds += 1;

            for index in 0..self.nodes.len() {
                for candidate in 0..self.nodes[index].candidates.len() {
                    if !self.nodes[index].alive[candidate] {
                        continue;
                    }

                    let viable = self.nodes[index].candidates[candidate]
                        .dependencies()
                        .all(|dep| self.nodes[dep].is_satisfiable());

                    if !viable {
                        self.nodes[index].alive[candidate] = false;
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        tracing::trace!("pruned {} requirements in {} rounds", self.nodes.len(), rounds);
    }

    fn choose(&self, roots: Vec<(Query, usize)>) -> Result<Solution, Vec<SolveError>> {
        let mut errors = Vec::new();
        let mut chosen: Vec<(usize, usize)> = Vec::new();
        let mut entry_of: HashMap<usize, EntryRef> = HashMap::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<usize> = roots.iter().map(|(_, index)| *index).collect();

        while let Some(index) = queue.pop_front() {
            if !visited.insert(index) {
                continue;
            }

            let node = &self.nodes[index];
            let alive: Vec<usize> = (0..node.candidates.len())
                .filter(|&candidate| node.alive[candidate])
                .collect();

            match alive.as_slice() {
                [] => errors.push(self.unsatisfiable(node)),
                [candidate] => {
                    entry_of.insert(index, EntryRef(chosen.len()));
                    chosen.push((index, *candidate));
                    queue.extend(node.candidates[*candidate].dependencies());
                }
                many => errors.push(SolveError::AmbiguousRule {
                    product: node.req.product.to_string(),
                    params: display_params(&node.req.scope),
                    candidates: many
                        .iter()
                        .map(|&candidate| self.describe(&node.candidates[candidate]))
                        .collect(),
                }),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let mut entries: Vec<Entry> = chosen
            .iter()
            .map(|&(index, candidate)| {
                let node = &self.nodes[index];
                let resolution = match &node.candidates[candidate] {
                    Candidate::Param => Resolution::Param(node.req.product),
                    Candidate::Rule { rule, inputs, gets } => Resolution::Rule(ResolvedRule {
                        rule: *rule,
                        inputs: inputs.iter().map(|dep| entry_of[dep]).collect(),
                        gets: gets.iter().map(|(get, dep)| (*get, entry_of[dep])).collect(),
                    }),
                };

                Entry {
                    product: node.req.product,
                    scope: node.req.scope.clone(),
                    used: BTreeSet::new(),
                    resolution,
                }
            })
            .collect();

        compute_used_params(&mut entries);

        let reachable: HashSet<RuleId> = entries
            .iter()
            .filter_map(|entry| match &entry.resolution {
                Resolution::Rule(resolved) => Some(resolved.rule),
                Resolution::Param(_) => None,
            })
            .collect();

        let unreachable = self
            .rules
            .iter()
            .map(Rule::id)
            .filter(|id| !reachable.contains(id))
            .collect();

        let roots = roots
            .into_iter()
            .map(|(query, index)| (query, entry_of[&index]))
            .collect();

        Ok(Solution {
            entries,
            roots,
            unreachable,
        })
    }

    fn unsatisfiable(&self, node: &Node) -> SolveError {
        let reason = if node.candidates.is_empty() {
            String::from(": no rule produces it and it is not a param in scope")
        } else {
            let rejected: Vec<String> = node
                .candidates
                .iter()
                .filter_map(|candidate| {
                    let Candidate::Rule { rule, .. } = candidate else {
                        return None;
                    };
                    let missing = candidate
                        .dependencies()
                        .map(|dep| &self.nodes[dep])
                        .find(|dep| !dep.is_satisfiable())?;
                    Some(format!(
                        "rule {} cannot get {} given ({})",
                        self.rules[rule.0].name(),
                        missing.req.product,
                        display_params(&missing.req.scope)
                    ))
                })
                .collect();

            format!(": {}", rejected.join("; "))
        };

        SolveError::UnsatisfiableRule {
            product: node.req.product.to_string(),
            params: display_params(&node.req.scope),
            reason,
        }
    }

    fn describe(&self, candidate: &Candidate) -> String {
        match candidate {
            Candidate::Param => String::from("param"),
            Candidate::Rule { rule, .. } => self.rules[rule.0].to_string(),
        }
    }
}

/// Least fixed point of the params each entry transitively consumes.
fn compute_used_params(entries: &mut [Entry]) {
    loop {
        let mut changed = false;

        for index in 0..entries.len() {
            let used: BTreeSet<TypeKey> = match &entries[index].resolution {
                Resolution::Param(product) => BTreeSet::from([*product]),
                Resolution::Rule(resolved) => {
                    let mut used = BTreeSet::new();
                    for input in &resolved.inputs {
                        used.extend(entries[input.0].used.iter().copied());
                    }
                    for (get, dep) in &resolved.gets {
                        used.extend(
                            entries[dep.0]
                                .used
                                .iter()
                                .copied()
                                .filter(|param| *param != get.subject),
                        );
                    }
                    used
                }
            };

            if used != entries[index].used {
                entries[index].used = used;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}
