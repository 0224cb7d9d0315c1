use crate::error::RegistryError;
use crate::types::{Product, TypeKey, TypeRegistry, Value};

/// A tuple of products used as the direct inputs of a rule.
///
/// This trait is implemented for tuples of up to twelve [`Product`]s, which
/// lets a rule body receive its inputs as concrete types:
///
/// ```rust,ignore
/// rules.rule().inputs::<(Name, Config)>().run(|(name, config)| ..);
/// ```
pub trait Params: Sized + Send + 'static {
    /// Registers every element type and returns their keys, in order.
    fn keys(registry: &mut TypeRegistry) -> Result<Vec<TypeKey>, RegistryError>;

    /// Rebuilds the tuple from type-erased values. Returns `None` if the
    /// number or the types of the values do not match.
    fn from_values(values: &[Value]) -> Option<Self>;
}

impl Params for () {
    fn keys(_: &mut TypeRegistry) -> Result<Vec<TypeKey>, RegistryError> {
        Ok(vec![])
    }

    fn from_values(values: &[Value]) -> Option<Self> {
        values.is_empty().then_some(())
    }
}

macro_rules! impl_params {
    ($($P:ident),*) => {
        impl<$($P),*> Params for ($($P,)*)
        where
            $($P: Product),* {
            fn keys(registry: &mut TypeRegistry) -> Result<Vec<TypeKey>, RegistryError> {
                Ok(vec![$(registry.register::<$P>()?,)*])
            }

            fn from_values(values: &[Value]) -> Option<Self> {
                let mut iter = values.iter();
                let result = ($(iter.next()?.downcast::<$P>()?,)*);
                iter.next().is_none().then_some(result)
            }
        }
    };
}

impl_params!(A);
impl_params!(A, B);
impl_params!(A, B, C);
impl_params!(A, B, C, D);
impl_params!(A, B, C, D, E);
impl_params!(A, B, C, D, E, F);
impl_params!(A, B, C, D, E, F, G);
impl_params!(A, B, C, D, E, F, G, H);
impl_params!(A, B, C, D, E, F, G, H, I);
impl_params!(A, B, C, D, E, F, G, H, I, J);
impl_params!(A, B, C, D, E, F, G, H, I, J, K);
impl_params!(A, B, C, D, E, F, G, H, I, J, K, L);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_from_values() {
        let values = vec![Value::new(1u32), Value::new(String::from("x"))];
        let (a, b) = <(u32, String)>::from_values(&values).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, "x");
    }

    #[test]
    fn test_tuple_rejects_mismatch() {
        let values = vec![Value::new(1u32)];
        assert!(<(String,)>::from_values(&values).is_none());
        assert!(<(u32, u32)>::from_values(&values).is_none());
        assert!(<()>::from_values(&values).is_none());
    }

    #[test]
    fn test_keys_register_in_order() {
        let mut registry = TypeRegistry::new();
        let keys = <(u32, String)>::keys(&mut registry).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], registry.key_of::<u32>().unwrap());
        assert_eq!(keys[1], registry.key_of::<String>().unwrap());
    }
}
