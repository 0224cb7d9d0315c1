//! Type identities and type-erased values.
//!
//! Rules are matched against each other purely by [`TypeKey`]: a rule
//! producing `TypeKey("Greeting")` can satisfy any request for that key. The
//! [`TypeRegistry`] binds each key to exactly one Rust type, which is what lets
//! the engine move values around as [`Value`]s and hand them back to rule
//! bodies as concrete types.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::{Blake3Hasher, Digest};
use crate::error::RegistryError;

/// Everything a rule consumes or produces.
///
/// Values must be immutable once produced, comparable and hashable: the
/// engine memoizes nodes by the exact values of their inputs.
pub trait Product: Any + Clone + Debug + Hash + Eq + Send + Sync {}

impl<T> Product for T where T: Any + Clone + Debug + Hash + Eq + Send + Sync {}

/// Stable identity of a type taking part in rule matching.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(&'static str);

impl TypeKey {
    /// The full registered name.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeKey({})", self.0)
    }
}

impl std::fmt::Display for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&short_name(self.0))
    }
}

/// Drops module paths from every identifier in a type name, so
/// `alloc::vec::Vec<my::Name>` becomes `Vec<Name>`.
pub(crate) fn short_name(name: &str) -> String {
    fn last(ident: &str) -> &str {
        ident.rsplit("::").next().unwrap_or(ident)
    }

    let mut out = String::with_capacity(name.len());
    let mut ident = String::new();

    for c in name.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            ident.push(c);
        } else {
            out.push_str(last(&ident));
            ident.clear();
            out.push(c);
        }
    }

    out.push_str(last(&ident));
    out
}

/// What the registry knows about a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub key: TypeKey,
    pub rust_type: TypeId,
    pub type_name: &'static str,
}

/// Mapping from type identity to the Rust type behind it.
///
/// A registry is filled while rules are registered and is read-only once the
/// [`RuleGraph`](crate::RuleGraph) has been built.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    by_key: HashMap<TypeKey, TypeDescriptor>,
    by_rust: HashMap<TypeId, TypeKey>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under its Rust type name. Registering a type again
    /// returns the key it already has, including one given through
    /// [`register_named`](Self::register_named).
    pub fn register<T: Product>(&mut self) -> Result<TypeKey, RegistryError> {
        if let Some(&key) = self.by_rust.get(&TypeId::of::<T>()) {
            return Ok(key);
        }

        self.register_named::<T>(type_name::<T>())
    }

    /// Registers `T` under an explicit identity.
    pub fn register_named<T: Product>(
        &mut self,
        name: &'static str,
    ) -> Result<TypeKey, RegistryError> {
        let key = TypeKey(name);
        let rust_type = TypeId::of::<T>();

        if let Some(existing) = self.by_key.get(&key) {
            if existing.rust_type == rust_type {
                return Ok(key);
            }

            return Err(RegistryError::DuplicateType {
                name: name.to_string(),
                existing: existing.type_name.to_string(),
                incoming: type_name::<T>().to_string(),
            });
        }

        if let Some(other) = self.by_rust.get(&rust_type) {
            return Err(RegistryError::DuplicateType {
                name: type_name::<T>().to_string(),
                existing: other.name().to_string(),
                incoming: name.to_string(),
            });
        }

        let descriptor = TypeDescriptor {
            key,
            rust_type,
            type_name: type_name::<T>(),
        };

        tracing::trace!("registered type {}", name);
        self.by_key.insert(key, descriptor);
        self.by_rust.insert(rust_type, key);

        Ok(key)
    }

    pub fn lookup(&self, key: TypeKey) -> Result<&TypeDescriptor, RegistryError> {
        self.by_key
            .get(&key)
            .ok_or_else(|| RegistryError::UnknownType(key.name().to_string()))
    }

    /// Finds a type by its registered name.
    pub fn find(&self, name: &str) -> Result<&TypeDescriptor, RegistryError> {
        self.by_key
            .values()
            .find(|descriptor| descriptor.key.name() == name)
            .ok_or_else(|| RegistryError::UnknownType(name.to_string()))
    }

    pub fn key_of<T: Any>(&self) -> Result<TypeKey, RegistryError> {
        self.key_of_rust(TypeId::of::<T>(), type_name::<T>())
    }

    pub fn key_of_value(&self, value: &Value) -> Result<TypeKey, RegistryError> {
        self.key_of_rust(value.rust_type, value.type_name)
    }

    fn key_of_rust(&self, id: TypeId, name: &'static str) -> Result<TypeKey, RegistryError> {
        self.by_rust
            .get(&id)
            .copied()
            .ok_or_else(|| RegistryError::UnknownType(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.by_key.values()
    }
}

trait DynProduct: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Product> DynProduct for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|other| other == self)
    }
}

/// A type-erased, immutable, shareable product.
///
/// Cloning a `Value` is a reference count increment. Values compare by their
/// Rust type and exact equality, and hash by a BLAKE3 digest of their content.
#[derive(Clone)]
pub struct Value {
    inner: Arc<dyn DynProduct>,
    rust_type: TypeId,
    type_name: &'static str,
    digest: Digest,
}

impl Value {
    pub fn new<T: Product>(value: T) -> Self {
        let digest = {
            let mut hasher = Blake3Hasher::default();
            type_name::<T>().hash(&mut hasher);
            value.hash(&mut hasher);
            hasher.into()
        };

        Self {
            inner: Arc::new(value),
            rust_type: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            digest,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// Clones the concrete product out of this value.
    pub fn downcast<T: Product>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.rust_type == TypeId::of::<T>()
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.rust_type == other.rust_type
            && self.digest == other.digest
            && self.inner.dyn_eq(other.inner.as_any())
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&*self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Name(String);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Alias(String);

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = TypeRegistry::new();
        let a = registry.register::<Name>().unwrap();
        let b = registry.register::<Name>().unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(a).unwrap().type_name, type_name::<Name>());
    }

    #[test]
    fn test_register_keeps_explicit_name() {
        let mut registry = TypeRegistry::new();
        let named = registry.register_named::<Name>("pkg.Name").unwrap();
        let again = registry.register::<Name>().unwrap();
        assert_eq!(named, again);
        assert_eq!(again.name(), "pkg.Name");
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let mut registry = TypeRegistry::new();
        registry.register_named::<Name>("Name").unwrap();

        let err = registry.register_named::<Alias>("Name").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateType { .. }));
    }

    #[test]
    fn test_same_type_under_two_names_is_rejected() {
        let mut registry = TypeRegistry::new();
        registry.register_named::<Name>("first").unwrap();

        let err = registry.register_named::<Name>("second").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateType { .. }));
    }

    #[test]
    fn test_unknown_type() {
        let registry = TypeRegistry::new();
        assert_eq!(
            registry.key_of::<Name>().unwrap_err(),
            RegistryError::UnknownType(type_name::<Name>().to_string())
        );
        assert!(registry.find("nope").is_err());
    }

    #[test]
    fn test_value_equality_and_digest() {
        let a = Value::new(Name("bob".into()));
        let b = Value::new(Name("bob".into()));
        let c = Value::new(Name("alice".into()));

        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a, c);
        assert_eq!(a.downcast::<Name>(), Some(Name("bob".into())));
        assert!(a.downcast_ref::<Alias>().is_none());
    }

    #[test]
    fn test_value_distinguishes_types_with_same_content() {
        let a = Value::new(Name("bob".into()));
        let b = Value::new(Alias("bob".into()));
        assert_ne!(a, b);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("alloc::vec::Vec<my::Name>"), "Vec<Name>");
        assert_eq!(short_name("(a::B, c::D)"), "(B, D)");
        assert_eq!(short_name("Plain"), "Plain");
    }
}
