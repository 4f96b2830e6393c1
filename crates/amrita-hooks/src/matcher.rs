// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tracing::debug;

use crate::depends::{Depends, HookArgs, HookError, HookKwargs, HookValue, Injected, ResolveCtx};
use crate::event::{HookEvent, MatchKind};

/// Where a handler parameter gets its value from.
#[derive(Clone)]
pub enum ParamSource {
    /// A declared dependency factory, resolved concurrently with siblings.
    Depends(Depends),
    /// `hook_kwargs[name]`, unwrapping factories.
    Kwarg,
    /// The first positional `hook_args` element whose runtime type matches
    /// the declared type, unwrapping factories.
    ArgByType,
}

/// Declarative description of one handler parameter beyond the event itself.
#[derive(Clone)]
pub struct ParamSpec {
    pub(crate) name: String,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) source: ParamSource,
    pub(crate) default: Option<Injected>,
}

/// The resolved parameter set handed to a handler.
#[derive(Default)]
pub struct BoundParams {
    values: HashMap<String, Injected>,
}

impl BoundParams {
    /// Fetch a bound parameter by name, downcast to its declared type.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.values.get(name)?.clone().downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

type HandlerFn = Arc<
    dyn for<'a> Fn(&'a mut HookEvent, &'a BoundParams) -> BoxFuture<'a, Result<(), HookError>>
        + Send
        + Sync,
>;

/// `(event-kind, handler, declared-params)`: one registered hook.
#[derive(Clone)]
pub struct Matcher {
    pub(crate) kind: MatchKind,
    pub(crate) params: Vec<ParamSpec>,
    pub(crate) handler: HandlerFn,
}

impl Matcher {
    pub fn builder(kind: MatchKind) -> MatcherBuilder {
        MatcherBuilder {
            kind,
            params: Vec::new(),
        }
    }

    /// Resolve this matcher's parameters against the caller-supplied hook
    /// arguments.  Binding order per slot: declared factory → kwargs →
    /// positional-by-type → default → skip the matcher.
    pub(crate) async fn bind(
        &self,
        args: &HookArgs,
        kwargs: &HookKwargs,
        exception_ignored: &[String],
    ) -> BindOutcome {
        enum Slot {
            Ready(Injected),
            Pending { dep: Depends, check_type: bool },
        }

        let mut slots: Vec<(usize, Slot)> = Vec::new();
        for (i, spec) in self.params.iter().enumerate() {
            let slot = match &spec.source {
                ParamSource::Depends(dep) => Some(Slot::Pending {
                    dep: dep.clone(),
                    check_type: false,
                }),
                ParamSource::Kwarg => match kwargs.get(&spec.name) {
                    Some(HookValue::Value(v)) if (**v).type_id() == spec.type_id => {
                        Some(Slot::Ready(Arc::clone(v)))
                    }
                    Some(HookValue::Value(_)) => None,
                    Some(HookValue::Factory(dep)) => Some(Slot::Pending {
                        dep: dep.clone(),
                        check_type: true,
                    }),
                    None => None,
                },
                ParamSource::ArgByType => {
                    let by_value = args.iter().find_map(|a| match a {
                        HookValue::Value(v) if (**v).type_id() == spec.type_id => {
                            Some(Slot::Ready(Arc::clone(v)))
                        }
                        _ => None,
                    });
                    by_value.or_else(|| {
                        // A positional factory's product type is unknown until
                        // it runs; schedule it and type-check afterwards.
                        args.iter().find_map(|a| match a {
                            HookValue::Factory(dep) => Some(Slot::Pending {
                                dep: dep.clone(),
                                check_type: true,
                            }),
                            _ => None,
                        })
                    })
                }
            };
            let slot = match slot.or_else(|| spec.default.clone().map(Slot::Ready)) {
                Some(s) => s,
                None => {
                    return BindOutcome::Skip(format!(
                        "parameter `{}: {}` has no binding source",
                        spec.name, spec.type_name
                    ))
                }
            };
            slots.push((i, slot));
        }

        // Resolve all pending factories in parallel.  Each factory runs with
        // the within-factory marker so nested Depends use is rejected.
        let mut pending = Vec::new();
        for (i, slot) in &slots {
            if let Slot::Pending { dep, .. } = slot {
                let dep = dep.clone();
                let idx = *i;
                pending.push(async move { (idx, dep.resolve(ResolveCtx::for_factory()).await) });
            }
        }
        let settled = join_all(pending).await;

        let mut resolved: HashMap<usize, Option<Injected>> = HashMap::new();
        let mut aggregate: Vec<String> = Vec::new();
        for (idx, result) in settled {
            match result {
                Ok(v) => {
                    resolved.insert(idx, v);
                }
                Err(e) => {
                    if let Some(kind) = e.kind() {
                        if exception_ignored.iter().any(|k| k == kind) {
                            return BindOutcome::Raise(e);
                        }
                    }
                    if matches!(e, HookError::Configuration(_)) {
                        // Depends-inside-factory is a programming error, not a
                        // runtime condition — always surfaced.
                        return BindOutcome::Raise(e);
                    }
                    aggregate.push(e.to_string());
                }
            }
        }
        if !aggregate.is_empty() {
            return BindOutcome::Error(HookError::DependencyResolution(aggregate));
        }

        let mut values = HashMap::new();
        for (i, slot) in slots {
            let spec = &self.params[i];
            let value = match slot {
                Slot::Ready(v) => v,
                Slot::Pending { check_type, .. } => match resolved.remove(&i).flatten() {
                    Some(v) => {
                        if check_type && (*v).type_id() != spec.type_id {
                            return BindOutcome::Skip(format!(
                                "factory for `{}` produced a value of the wrong type (want {})",
                                spec.name, spec.type_name
                            ));
                        }
                        v
                    }
                    // The unavailable sentinel: skip without noise.
                    None => {
                        debug!(param = %spec.name, "dependency unavailable; skipping matcher");
                        return BindOutcome::Skip(format!(
                            "dependency for `{}` unavailable",
                            spec.name
                        ));
                    }
                },
            };
            values.insert(spec.name.clone(), value);
        }
        BindOutcome::Bound(BoundParams { values })
    }
}

/// Result of binding one matcher's parameters.
pub(crate) enum BindOutcome {
    Bound(BoundParams),
    /// Matcher does not fire; dispatch continues.
    Skip(String),
    /// Non-ignored factory errors aggregated; matcher skipped, aggregate
    /// reported to the dispatcher's caller.
    Error(HookError),
    /// Ignored-kind (or configuration) error re-raised to the caller.
    Raise(HookError),
}

/// Builder DSL for matchers: declare parameters, then attach the handler.
pub struct MatcherBuilder {
    kind: MatchKind,
    params: Vec<ParamSpec>,
}

impl MatcherBuilder {
    /// Declare a parameter fed by a dependency factory.
    pub fn depends<T: Send + Sync + 'static>(mut self, name: impl Into<String>, dep: Depends) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            source: ParamSource::Depends(dep),
            default: None,
        });
        self
    }

    /// Declare a parameter bound from `hook_kwargs` by name.
    pub fn kwarg<T: Send + Sync + 'static>(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            source: ParamSource::Kwarg,
            default: None,
        });
        self
    }

    /// Declare a parameter bound from positional `hook_args` by type.
    pub fn arg_by_type<T: Send + Sync + 'static>(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            source: ParamSource::ArgByType,
            default: None,
        });
        self
    }

    /// Give the most recently declared parameter a fallback value, used when
    /// no binding source supplies one (instead of skipping the matcher).
    pub fn or_default<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        if let Some(last) = self.params.last_mut() {
            last.default = Some(Arc::new(value));
        }
        self
    }

    /// Attach an async handler and finish the matcher.
    pub fn handler<F>(self, f: F) -> Matcher
    where
        F: for<'a> Fn(&'a mut HookEvent, &'a BoundParams) -> BoxFuture<'a, Result<(), HookError>>
            + Send
            + Sync
            + 'static,
    {
        Matcher {
            kind: self.kind,
            params: self.params,
            handler: Arc::new(f),
        }
    }

    /// Attach a synchronous handler; it is invoked directly (no task hop).
    pub fn handler_sync<F>(self, f: F) -> Matcher
    where
        F: Fn(&mut HookEvent, &BoundParams) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Matcher {
            kind: self.kind,
            params: self.params,
            handler: Arc::new(move |ev, params| {
                let result = f(ev, params);
                Box::pin(std::future::ready(result))
            }),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
