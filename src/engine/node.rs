use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::ArcStr;
use crate::rule_graph::EntryRef;
use crate::types::{TypeKey, Value};

/// Unique identity of one physical node instance. A key cleaned and then
/// requested again gets a new entry with a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

/// Content-derived identity of a node: the rule graph entry plus the exact
/// values of the params it uses.
///
/// Cloning a key is cheap. Two keys are equal only if their entries and all
/// of their param values are equal.
#[derive(Clone)]
pub struct NodeKey(Arc<KeyInner>);

struct KeyInner {
    entry: EntryRef,
    /// Sorted by type key.
    params: Box<[(TypeKey, Value)]>,
    rule: ArcStr,
}

impl NodeKey {
    pub(crate) fn new(entry: EntryRef, rule: &str, mut params: Vec<(TypeKey, Value)>) -> Self {
        params.sort_by_key(|(key, _)| *key);
        Self(Arc::new(KeyInner {
            entry,
            params: params.into_boxed_slice(),
            rule: rule.into(),
        }))
    }

    pub fn entry(&self) -> EntryRef {
        self.0.entry
    }

    pub fn rule(&self) -> &str {
        &self.0.rule
    }

    pub fn params(&self) -> &[(TypeKey, Value)] {
        &self.0.params
    }

    /// The params of this node with `subject` added, replacing any value of
    /// the same type.
    pub(crate) fn scope_with(&self, ty: TypeKey, subject: Value) -> Vec<(TypeKey, Value)> {
        let mut scope: Vec<_> = self
            .params()
            .iter()
            .filter(|(key, _)| *key != ty)
            .cloned()
            .collect();
        scope.push((ty, subject));
        scope
    }
}

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.entry == other.0.entry && self.0.params == other.0.params)
    }
}

impl Eq for NodeKey {}

impl Hash for NodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.entry.hash(state);
        self.0.params.hash(state);
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.0.rule)?;
        for (i, (_, value)) in self.0.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value:?}")?;
        }
        f.write_str(")")
    }
}

impl Debug for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeKey({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_compare_by_content() {
        let a = NodeKey::new(EntryRef(0), "rule", vec![]);
        let b = NodeKey::new(EntryRef(0), "rule", vec![]);
        let c = NodeKey::new(EntryRef(1), "rule", vec![]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display_lists_param_values() {
        let mut registry = crate::TypeRegistry::new();
        let ty = registry.register::<String>().unwrap();
        let key = NodeKey::new(EntryRef(3), "greet", vec![(ty, Value::new(String::from("bob")))]);
        assert_eq!(key.to_string(), "greet(\"bob\")");
    }

    #[test]
    fn test_scope_with_replaces_same_type() {
        let mut registry = crate::TypeRegistry::new();
        let ty = registry.register::<String>().unwrap();
        let key = NodeKey::new(EntryRef(0), "r", vec![(ty, Value::new(String::from("a")))]);

        let scope = key.scope_with(ty, Value::new(String::from("b")));
        assert_eq!(scope.len(), 1);
        assert_eq!(scope[0].1.downcast::<String>().as_deref(), Some("b"));
    }
}
