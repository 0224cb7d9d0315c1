use std::any::type_name;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;

use crate::engine::RuleContext;
use crate::error::RegistryError;
use crate::rules::{Body, GetDecl, Params, Query, Rule, RuleFuture, RuleId, RuleSet};
use crate::types::{Product, TypeKey, Value};

/// Builder for a single rule, obtained from [`RuleSet::rule`].
///
/// The type parameter tracks the declared inputs so that the body receives
/// them as a typed tuple.
pub struct RuleDef<'a, I = ()> {
    set: &'a mut RuleSet,
    name: Option<Cow<'static, str>>,
    inputs: Vec<TypeKey>,
    gets: Vec<GetDecl>,
    cacheable: bool,
    error: Option<RegistryError>,
    _inputs: PhantomData<fn() -> I>,
}

impl<'a> RuleDef<'a, ()> {
    pub(crate) fn new(set: &'a mut RuleSet) -> Self {
        Self {
            set,
            name: None,
            inputs: Vec::new(),
            gets: Vec::new(),
            cacheable: true,
            error: None,
            _inputs: PhantomData,
        }
    }
}

impl<'a, I: Params> RuleDef<'a, I> {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares the direct inputs of the rule as a tuple of products.
    pub fn inputs<J: Params>(mut self) -> RuleDef<'a, J> {
        let inputs = match J::keys(&mut self.set.registry) {
            Ok(keys) => keys,
            Err(err) => {
                self.error.get_or_insert(err);
                Vec::new()
            }
        };

        RuleDef {
            set: self.set,
            name: self.name,
            inputs,
            gets: self.gets,
            cacheable: self.cacheable,
            error: self.error,
            _inputs: PhantomData,
        }
    }

    /// Declares that the body may request `P` given a value of `S`.
    pub fn get<P: Product, S: Product>(mut self) -> Self {
        let registry = &mut self.set.registry;
        match registry
            .register::<P>()
            .and_then(|product| Ok((product, registry.register::<S>()?)))
        {
            Ok((product, subject)) => self.gets.push(GetDecl { product, subject }),
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
        self
    }

    /// Marks the rule as uncacheable: its result is only reused within a
    /// single session.
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Registers a pure body, a function of the inputs alone.
    pub fn run<F, O>(self, body: F) -> Result<RuleId, RegistryError>
    where
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Product,
    {
        let name = type_name::<F>();
        let body = Body::Pure(Arc::new(move |values: &[Value]| {
            let args = I::from_values(values)
                .ok_or_else(|| anyhow!("inputs do not match the declared parameter types"))?;
            body(args).map(Value::new)
        }));

        self.finish::<O>(name, body)
    }

    /// Registers an asynchronous body, which may suspend on
    /// [`RuleContext::get`].
    pub fn run_async<F, Fut, O>(self, body: F) -> Result<RuleId, RegistryError>
    where
        F: Fn(RuleContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        O: Product,
    {
        let name = type_name::<F>();
        let body = Body::Async(Arc::new(move |ctx, values: Vec<Value>| -> RuleFuture {
            match I::from_values(&values) {
                Some(args) => {
                    let future = body(ctx, args);
                    Box::pin(async move { future.await.map(Value::new) })
                }
                None => Box::pin(async {
                    Err(anyhow!("inputs do not match the declared parameter types"))
                }),
            }
        }));

        self.finish::<O>(name, body)
    }

    fn finish<O: Product>(self, fallback: &'static str, body: Body) -> Result<RuleId, RegistryError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let output = self.set.registry.register::<O>()?;
        let named = self.name.is_some();
        let rule = Rule {
            id: RuleId(self.set.rules.len()),
            name: self.name.unwrap_or(Cow::Borrowed(fallback)),
            named,
            output,
            inputs: self.inputs,
            gets: self.gets,
            body,
            cacheable: self.cacheable,
        };

        Ok(self.set.push_rule(rule))
    }
}

/// Builder for a query, obtained from [`RuleSet::query`].
pub struct QueryDef<'a> {
    set: &'a mut RuleSet,
    product: Result<TypeKey, RegistryError>,
    params: BTreeSet<TypeKey>,
    error: Option<RegistryError>,
}

impl<'a> QueryDef<'a> {
    pub(crate) fn new<P: Product>(set: &'a mut RuleSet) -> Self {
        let product = set.registry.register::<P>();
        Self {
            set,
            product,
            params: BTreeSet::new(),
            error: None,
        }
    }

    /// Adds a root parameter type.
    pub fn param<S: Product>(mut self) -> Self {
        match self.set.registry.register::<S>() {
            Ok(key) => {
                self.params.insert(key);
            }
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
        self
    }

    pub fn register(self) -> Result<(), RegistryError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let query = Query {
            product: self.product?,
            params: self.params,
        };

        tracing::debug!("registered {}", query);
        self.set.queries.insert(query);
        Ok(())
    }
}
