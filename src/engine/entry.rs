use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;

use crate::core::lock;
use crate::engine::{EntryId, NodeKey, NodeResult};
use crate::error::Failure;
use crate::invalidation::{InvalidationIndex, Observable};

/// Lifecycle of a node.
///
/// `Pending -> Running -> Completed | Failed`, and from any state to
/// `Cleaned` when invalidated. A cleaned entry is never reused: the next
/// request for the same key creates a fresh one. An uncacheable entry
/// completed by an earlier session goes back to `Running` when a later
/// session requests it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    Cleaned,
}

struct EntryInner {
    state: NodeState,
    observed: Vec<Observable>,
    /// Set once the rule or one of its dependencies turns out to be
    /// uncacheable. Never unset.
    uncacheable: bool,
    /// Session which started the current run.
    run: u64,
}

/// One physical node in the execution graph.
pub(crate) struct Entry {
    id: EntryId,
    key: NodeKey,
    inner: Mutex<EntryInner>,
    done: watch::Sender<Option<NodeResult>>,
}

impl Entry {
    pub fn new(id: EntryId, key: NodeKey) -> Self {
        Self {
            id,
            key,
            inner: Mutex::new(EntryInner {
                state: NodeState::Pending,
                observed: Vec::new(),
                uncacheable: false,
                run: 0,
            }),
            done: watch::Sender::new(None),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn state(&self) -> NodeState {
        lock(&self.inner).state
    }

    pub fn is_cleaned(&self) -> bool {
        self.state() == NodeState::Cleaned
    }

    /// Moves a pending entry to running on behalf of session `run`.
    /// Returns `true` for exactly one caller, which is then responsible for
    /// driving the node.
    ///
    /// An uncacheable entry whose result was produced for another session
    /// is restarted in place.
    pub fn try_start(&self, run: u64) -> bool {
        let mut inner = lock(&self.inner);
        match inner.state {
            NodeState::Pending => {}
            NodeState::Completed | NodeState::Failed if inner.uncacheable && inner.run != run => {
                tracing::trace!("rerunning {} for session {}", self.key, run);
                self.done.send_replace(None);
            }
            _ => return false,
        }

        inner.state = NodeState::Running;
        inner.run = run;
        true
    }

    pub fn mark_uncacheable(&self) {
        lock(&self.inner).uncacheable = true;
    }

    pub fn is_uncacheable(&self) -> bool {
        lock(&self.inner).uncacheable
    }

    /// Registers an observable in the index, unless the entry has already
    /// been cleaned, in which case its result will never be reused anyway.
    pub fn observe(&self, observable: Observable, index: &InvalidationIndex) {
        let mut inner = lock(&self.inner);
        if inner.state == NodeState::Cleaned || inner.observed.contains(&observable) {
            return;
        }

        index.record_dependency(&self.key, self.id, &observable);
        inner.observed.push(observable);
    }

    /// Publishes the result to every waiter.
    ///
    /// An entry cleaned while it ran may have read stale inputs: it stays
    /// cleaned and its waiters get `Invalidated` instead of the result.
    pub fn complete(&self, result: NodeResult) {
        let result = {
            let mut inner = lock(&self.inner);
            if inner.state == NodeState::Cleaned {
                match result {
                    Err(failure) if failure.is_cancelled() => Err(failure),
                    _ => Err(Failure::invalidated()),
                }
            } else {
                inner.state = match result {
                    Ok(_) => NodeState::Completed,
                    Err(_) => NodeState::Failed,
                };
                result
            }
        };

        self.done.send_replace(Some(result));
    }

    /// Marks the entry as cleaned and prunes its index registrations.
    /// Returns `false` if it was already cleaned.
    pub fn clean(&self, index: &InvalidationIndex) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == NodeState::Cleaned {
            return false;
        }

        inner.state = NodeState::Cleaned;
        let observed = std::mem::take(&mut inner.observed);
        index.remove(self.id, &observed);
        true
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), NodeState::Completed | NodeState::Failed)
    }

    /// The published result, if any.
    pub fn peek(&self) -> Option<NodeResult> {
        self.done.borrow().clone()
    }

    /// Waits until the entry publishes a result.
    pub async fn wait(&self) -> NodeResult {
        let mut receiver = self.done.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(result) => result
                .clone()
                .unwrap_or_else(|| Err(Failure::internal("entry woke without a result"))),
            Err(_) => Err(Failure::cancelled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use crate::engine::test_key;

    #[test]
    fn test_only_one_caller_starts() {
        let entry = Entry::new(EntryId(0), test_key("a"));
        assert!(entry.try_start(1));
        assert!(!entry.try_start(1));
        assert!(!entry.try_start(2));
        assert_eq!(entry.state(), NodeState::Running);
    }

    #[test]
    fn test_complete_then_clean() {
        let index = InvalidationIndex::new(1);
        let entry = Entry::new(EntryId(0), test_key("a"));
        entry.try_start(1);
        entry.observe(Observable::path("/x"), &index);
        entry.observe(Observable::path("/x"), &index);
        assert_eq!(index.len(), 1);

        entry.complete(Ok(Value::new(1u8)));
        assert_eq!(entry.state(), NodeState::Completed);
        assert!(entry.peek().unwrap().is_ok());

        assert!(entry.clean(&index));
        assert!(!entry.clean(&index));
        assert_eq!(entry.state(), NodeState::Cleaned);
        assert_eq!(index.len(), 0);

        entry.observe(Observable::path("/y"), &index);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_cleaned_entry_stays_cleaned_on_completion() {
        let index = InvalidationIndex::new(1);
        let entry = Entry::new(EntryId(0), test_key("a"));
        entry.try_start(1);
        entry.clean(&index);
        entry.complete(Err(Failure::cancelled()));
        assert_eq!(entry.state(), NodeState::Cleaned);
        assert!(entry.peek().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_cleaned_entry_withholds_its_result() {
        let index = InvalidationIndex::new(1);
        let entry = Entry::new(EntryId(0), test_key("a"));
        entry.try_start(1);
        entry.clean(&index);
        entry.complete(Ok(Value::new(1u8)));

        assert_eq!(entry.state(), NodeState::Cleaned);
        assert!(entry.peek().unwrap().unwrap_err().is_invalidated());
    }

    #[test]
    fn test_uncacheable_entry_restarts_for_another_session() {
        let entry = Entry::new(EntryId(0), test_key("a"));
        assert!(entry.try_start(1));
        entry.mark_uncacheable();
        entry.complete(Ok(Value::new(1u8)));

        assert!(!entry.try_start(1));
        assert!(entry.try_start(2));
        assert_eq!(entry.state(), NodeState::Running);
        assert!(entry.peek().is_none());
        assert!(entry.is_uncacheable());
    }

    #[test]
    fn test_cacheable_entry_is_shared_across_sessions() {
        let entry = Entry::new(EntryId(0), test_key("a"));
        assert!(entry.try_start(1));
        entry.complete(Ok(Value::new(1u8)));
        assert!(!entry.try_start(2));
        assert_eq!(entry.state(), NodeState::Completed);
    }

    #[test]
    fn test_wait_sees_published_result() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let entry = Entry::new(EntryId(0), test_key("a"));
        entry.complete(Ok(Value::new(5u32)));

        let value = runtime.block_on(entry.wait()).unwrap();
        assert_eq!(value.downcast::<u32>(), Some(5));
    }
}
