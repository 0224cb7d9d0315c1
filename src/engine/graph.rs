use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::algo::astar;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Dfs, EdgeRef, Reversed};

use crate::core::lock;
use crate::engine::entry::{Entry, NodeState};
use crate::engine::{EntryId, NodeKey, NodeResult};
use crate::error::ExecutionError;
use crate::invalidation::{InvalidationIndex, InvalidationResult};

type Shard = Mutex<HashMap<NodeKey, Arc<Entry>>>;

/// Dependency edges between node keys. An edge `a -> b` means that `a` read
/// the result of `b`.
#[derive(Default)]
struct Edges {
    graph: StableDiGraph<NodeKey, ()>,
    index: HashMap<NodeKey, NodeIndex>,
}

impl Edges {
    fn node(&mut self, key: &NodeKey) -> NodeIndex {
        let graph = &mut self.graph;
        *self
            .index
            .entry(key.clone())
            .or_insert_with(|| graph.add_node(key.clone()))
    }

    fn remove(&mut self, key: &NodeKey) {
        if let Some(index) = self.index.remove(key) {
            self.graph.remove_node(index);
        }
    }
}

/// The execution graph: a sharded table of live node entries, the
/// dependency edges between them, and the invalidation index kept in step
/// with both.
///
/// Lock order is edges, then a shard, then an entry, then the index. No
/// code path takes them in another order.
pub(crate) struct Graph {
    shards: Box<[Shard]>,
    hasher: RandomState,
    edges: Mutex<Edges>,
    ids: AtomicU64,
    index: InvalidationIndex,
}

impl Graph {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::default()).collect(),
            hasher: RandomState::new(),
            edges: Mutex::default(),
            ids: AtomicU64::new(0),
            index: InvalidationIndex::new(shards),
        }
    }

    fn shard(&self, key: &NodeKey) -> &Shard {
        let hash = self.hasher.hash_one(key);
        &self.shards[hash as usize % self.shards.len()]
    }

    pub fn index(&self) -> &InvalidationIndex {
        &self.index
    }

    /// Returns the live entry for `key`, creating a pending one if there is
    /// none. Concurrent callers always observe the same entry.
    pub fn get_or_create(&self, key: &NodeKey) -> Arc<Entry> {
        let mut shard = lock(self.shard(key));
        shard
            .entry(key.clone())
            .or_insert_with(|| {
                let id = EntryId(self.ids.fetch_add(1, Ordering::Relaxed));
                tracing::trace!("created {} as {:?}", key, id);
                Arc::new(Entry::new(id, key.clone()))
            })
            .clone()
    }

    pub fn get(&self, key: &NodeKey) -> Option<Arc<Entry>> {
        lock(self.shard(key)).get(key).cloned()
    }

    pub fn state(&self, key: &NodeKey) -> Option<NodeState> {
        self.get(key).map(|entry| entry.state())
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    /// Records that `src` waits on `dst`, refusing any edge that would close
    /// a cycle.
    pub fn add_dependency(&self, src: &NodeKey, dst: &NodeKey) -> Result<(), ExecutionError> {
        if src == dst {
            return Err(ExecutionError::Cycle(vec![src.to_string(), dst.to_string()]));
        }

        let mut edges = lock(&self.edges);
        let s = edges.node(src);
        let d = edges.node(dst);

        if edges.graph.contains_edge(s, d) {
            return Ok(());
        }

        if let Some((_, path)) = astar(&edges.graph, d, |n| n == s, |_| 1usize, |_| 0) {
            let mut cycle = vec![src.to_string()];
            cycle.extend(path.into_iter().map(|n| edges.graph[n].to_string()));
            return Err(ExecutionError::Cycle(cycle));
        }

        edges.graph.add_edge(s, d, ());
        Ok(())
    }

    /// Publishes the result of a node. Cancelled nodes are evicted instead
    /// of memoized, so that the next request runs them again.
    pub fn complete(&self, entry: &Arc<Entry>, result: NodeResult) {
        if result.as_ref().is_err_and(|failure| failure.is_cancelled()) {
            self.evict(entry);
        }

        entry.complete(result);
    }

    fn evict(&self, entry: &Arc<Entry>) {
        let _edges = lock(&self.edges);
        let mut shard = lock(self.shard(entry.key()));
        if shard
            .get(entry.key())
            .is_some_and(|live| live.id() == entry.id())
        {
            shard.remove(entry.key());
        }
        entry.clean(&self.index);
    }

    /// Cleans every node registered against one of the changed paths,
    /// together with the full closure of nodes depending on them.
    pub fn invalidate_paths(&self, changed: &[Utf8PathBuf]) -> InvalidationResult {
        let roots = self.index.lookup(changed);
        if roots.is_empty() {
            return InvalidationResult::default();
        }

        self.invalidate(roots)
    }

    pub fn invalidate(&self, roots: Vec<NodeKey>) -> InvalidationResult {
        let mut edges = lock(&self.edges);

        let mut closure: Vec<NodeKey> = Vec::new();
        let mut seen: HashSet<NodeKey> = HashSet::new();
        {
            let reversed = Reversed(&edges.graph);
            let mut dfs = Dfs::empty(reversed);

            for root in &roots {
                if seen.insert(root.clone()) {
                    closure.push(root.clone());
                }

                let Some(&start) = edges.index.get(root) else {
                    continue;
                };

                dfs.move_to(start);
                while let Some(node) = dfs.next(reversed) {
                    let key = &edges.graph[node];
                    if seen.insert(key.clone()) {
                        closure.push(key.clone());
                    }
                }
            }
        }

        // Cleaned nodes record their dependencies again when they re-run.
        for key in &closure {
            if let Some(&node) = edges.index.get(key) {
                let outgoing: Vec<_> = edges
                    .graph
                    .edges_directed(node, Direction::Outgoing)
                    .map(|edge| edge.id())
                    .collect();
                for edge in outgoing {
                    edges.graph.remove_edge(edge);
                }
            }
        }

        for key in &closure {
            let orphan = edges.index.get(key).is_some_and(|&node| {
                edges
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .next()
                    .is_none()
            });
            if orphan {
                edges.remove(key);
            }
        }

        let roots: HashSet<NodeKey> = roots.into_iter().collect();
        let mut result = InvalidationResult::default();

        for key in &closure {
            let Some(entry) = lock(self.shard(key)).remove(key) else {
                continue;
            };

            if entry.clean(&self.index) {
                if roots.contains(key) {
                    result.cleared += 1;
                } else {
                    result.dirtied += 1;
                }
            }
        }

        drop(edges);

        tracing::debug!(
            "invalidated {} nodes, {} dependents",
            result.cleared,
            result.dirtied
        );
        result
    }

    /// Drops completed and failed nodes not reachable from `roots`. Returns
    /// the number of nodes dropped.
    pub fn garbage_collect(&self, roots: &[NodeKey]) -> usize {
        let mut edges = lock(&self.edges);

        let mut reachable: HashSet<NodeKey> = roots.iter().cloned().collect();
        {
            let mut dfs = Dfs::empty(&edges.graph);
            for root in roots {
                let Some(&start) = edges.index.get(root) else {
                    continue;
                };
                dfs.move_to(start);
                while let Some(node) = dfs.next(&edges.graph) {
                    reachable.insert(edges.graph[node].clone());
                }
            }
        }

        let mut collected = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            let garbage: Vec<NodeKey> = shard
                .iter()
                .filter(|(key, entry)| !reachable.contains(*key) && entry.is_terminal())
                .map(|(key, _)| key.clone())
                .collect();

            for key in garbage {
                if let Some(entry) = shard.remove(&key) {
                    entry.clean(&self.index);
                    edges.remove(&key);
                    collected += 1;
                }
            }
        }

        tracing::debug!("collected {} unreachable nodes", collected);
        collected
    }

    /// Drops every node. Running nodes finish but their results are not
    /// kept.
    pub fn clear(&self) -> usize {
        let mut edges = lock(&self.edges);
        let mut cleared = 0;

        for shard in self.shards.iter() {
            for (_, entry) in lock(shard).drain() {
                entry.clean(&self.index);
                cleared += 1;
            }
        }

        *edges = Edges::default();
        cleared
    }
}
