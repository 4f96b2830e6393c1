// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

/// A type-erased value bound into a handler parameter slot.
pub type Injected = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    /// A dependency factory failed.  `kind` is the machine-readable error
    /// class matched against a turn's `exception_ignored` list.
    #[error("dependency factory failed [{kind}]: {message}")]
    Factory { kind: String, message: String },
    /// Non-ignored factory errors aggregated after all resolutions settled.
    #[error("dependency resolution failed: {0:?}")]
    DependencyResolution(Vec<String>),
    #[error("hook configuration error: {0}")]
    Configuration(String),
    #[error("handler failed: {0}")]
    Handler(String),
}

impl HookError {
    pub fn factory(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Factory {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The error class used for `exception_ignored` matching.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Factory { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

type FactoryFn =
    dyn Fn(ResolveCtx) -> BoxFuture<'static, Result<Option<Injected>, HookError>> + Send + Sync;

/// A dependency factory: an async producer whose result is injected into a
/// handler parameter slot.
///
/// Factories declared by one handler are resolved concurrently.  A factory
/// returning `Ok(None)` signals "unavailable" and silently skips the handler.
#[derive(Clone)]
pub struct Depends {
    factory: Arc<FactoryFn>,
}

impl Depends {
    /// Wrap a plain async factory.
    pub fn new<T, Fut, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>, HookError>> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(move |_ctx| {
                let fut = f();
                async move { Ok(fut.await?.map(|v| Arc::new(v) as Injected)) }.boxed()
            }),
        }
    }

    /// Wrap a factory that always produces a value.
    pub fn value<T, Fut, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
    {
        Self::new(move || {
            let fut = f();
            async move { Ok(Some(fut.await)) }
        })
    }

    /// Wrap a factory that receives the resolution context.
    ///
    /// The context exists to *enforce* the layering rule: a factory that
    /// tries to resolve another [`Depends`] through it gets a
    /// [`HookError::Configuration`].
    pub fn with_ctx<T, Fut, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>, HookError>> + Send + 'static,
        F: Fn(ResolveCtx) -> Fut + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(move |ctx| {
                let fut = f(ctx);
                async move { Ok(fut.await?.map(|v| Arc::new(v) as Injected)) }.boxed()
            }),
        }
    }

    /// Run the factory.  `ctx` must come from the dispatcher (or
    /// [`ResolveCtx::root`] in tests).
    pub async fn resolve(&self, ctx: ResolveCtx) -> Result<Option<Injected>, HookError> {
        (self.factory)(ctx).await
    }
}

impl std::fmt::Debug for Depends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Depends(..)")
    }
}

/// Per-resolution marker threaded through factory execution.
///
/// The dispatcher resolves each declared factory with `within_factory = true`.
/// A factory that itself tries to resolve a `Depends` through its context is
/// therefore detected and rejected — dependency graphs are one level deep.
#[derive(Debug, Clone, Copy)]
pub struct ResolveCtx {
    within_factory: bool,
}

impl ResolveCtx {
    /// Entry context for the dispatcher (and for direct use in tests).
    pub fn root() -> Self {
        Self {
            within_factory: false,
        }
    }

    pub(crate) fn for_factory() -> Self {
        Self {
            within_factory: true,
        }
    }

    /// Resolve a nested dependency.  Fails when called from inside a factory.
    pub async fn resolve(&self, dep: &Depends) -> Result<Option<Injected>, HookError> {
        if self.within_factory {
            return Err(HookError::Configuration(
                "a dependency factory may not use Depends itself".into(),
            ));
        }
        dep.resolve(Self::for_factory()).await
    }
}

/// A caller-supplied hook argument: either a concrete value or a factory
/// that is unwrapped (resolved concurrently) before binding.
#[derive(Clone)]
pub enum HookValue {
    Value(Injected),
    Factory(Depends),
}

impl HookValue {
    pub fn value<T: Send + Sync + 'static>(v: T) -> Self {
        Self::Value(Arc::new(v))
    }

    pub fn factory(d: Depends) -> Self {
        Self::Factory(d)
    }
}

impl std::fmt::Debug for HookValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(_) => f.write_str("HookValue::Value(..)"),
            Self::Factory(_) => f.write_str("HookValue::Factory(..)"),
        }
    }
}

/// Positional hook arguments, bound to handler parameters by declared type.
pub type HookArgs = Vec<HookValue>;

/// Named hook arguments, bound to handler parameters by name.
pub type HookKwargs = HashMap<String, HookValue>;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_produces_injected_value() {
        let dep = Depends::value(|| async { 42u32 });
        let v = ResolveCtx::root().resolve(&dep).await.unwrap().unwrap();
        assert_eq!(*v.downcast::<u32>().unwrap(), 42);
    }

    #[tokio::test]
    async fn factory_none_is_unavailable_sentinel() {
        let dep = Depends::new(|| async { Ok::<Option<u32>, HookError>(None) });
        let v = ResolveCtx::root().resolve(&dep).await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn factory_error_carries_kind() {
        let dep = Depends::new(|| async {
            Err::<Option<u32>, _>(HookError::factory("db_error", "connection refused"))
        });
        let err = ResolveCtx::root().resolve(&dep).await.unwrap_err();
        assert_eq!(err.kind(), Some("db_error"));
    }

    #[tokio::test]
    async fn factory_resolving_depends_is_a_configuration_error() {
        let inner = Depends::value(|| async { 1u8 });
        let outer = Depends::with_ctx(move |ctx: ResolveCtx| {
            let inner = inner.clone();
            async move {
                // Layering violation: a factory may not resolve factories.
                let v = ctx.resolve(&inner).await?;
                Ok(v.map(|_| 2u8))
            }
        });
        let err = ResolveCtx::root().resolve(&outer).await.unwrap_err();
        assert!(matches!(err, HookError::Configuration(_)));
    }

    #[tokio::test]
    async fn root_context_may_resolve_directly() {
        let dep = Depends::value(|| async { "ok".to_string() });
        let v = ResolveCtx::root().resolve(&dep).await.unwrap().unwrap();
        assert_eq!(*v.downcast::<String>().unwrap(), "ok");
    }
}
