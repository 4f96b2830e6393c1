// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, OnceLock, RwLock};

use tracing::warn;

use crate::depends::{HookArgs, HookError, HookKwargs};
use crate::event::{
    CompletionEvent, CustomEvent, FallbackContext, HookEvent, MatchKind, PreCompletionEvent,
};
use crate::matcher::{BindOutcome, Matcher, MatcherBuilder};

/// What one dispatch pass did.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Handlers that ran.
    pub fired: usize,
    /// Matchers skipped (unbound parameter, unavailable dependency, type
    /// mismatch).
    pub skipped: usize,
    /// Aggregated non-ignored dependency errors and handler failures; the
    /// engine may inspect these and continue.
    pub errors: Vec<HookError>,
}

/// Event → handler routing table.
///
/// Matchers fire in registration order per event kind, sequentially — earlier
/// handlers may mutate the event that later handlers receive.  Registration
/// is explicit (no import-time side effects); a process-wide default registry
/// exists for the common case and tests instantiate their own.
#[derive(Default)]
pub struct HookRegistry {
    matchers: RwLock<Vec<Matcher>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, matcher: Matcher) {
        self.matchers.write().expect("hook lock poisoned").push(matcher);
    }

    /// Number of matchers registered for `kind`.
    pub fn count(&self, kind: &MatchKind) -> usize {
        self.matchers
            .read()
            .expect("hook lock poisoned")
            .iter()
            .filter(|m| m.kind == *kind)
            .count()
    }

    // ── Declarative registration helpers (one per event kind) ─────────────────

    /// Register a plain pre-completion handler (event only, no extra params).
    pub fn on_pre_completion<F>(&self, f: F)
    where
        F: Fn(&mut PreCompletionEvent) + Send + Sync + 'static,
    {
        self.register(
            Matcher::builder(MatchKind::PreCompletion).handler_sync(move |ev, _p| {
                if let Some(e) = ev.as_pre_completion_mut() {
                    f(e);
                }
                Ok(())
            }),
        );
    }

    /// Register a plain completion handler.
    pub fn on_completion<F>(&self, f: F)
    where
        F: Fn(&mut CompletionEvent) + Send + Sync + 'static,
    {
        self.register(
            Matcher::builder(MatchKind::Completion).handler_sync(move |ev, _p| {
                if let Some(e) = ev.as_completion_mut() {
                    f(e);
                }
                Ok(())
            }),
        );
    }

    /// Register a preset-fallback handler.
    pub fn on_preset_fallback<F>(&self, f: F)
    where
        F: Fn(&mut FallbackContext) + Send + Sync + 'static,
    {
        self.register(
            Matcher::builder(MatchKind::PresetFallback).handler_sync(move |ev, _p| {
                if let Some(e) = ev.as_fallback_mut() {
                    f(e);
                }
                Ok(())
            }),
        );
    }

    /// Register a handler for a named custom event.
    pub fn on_event<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut CustomEvent) + Send + Sync + 'static,
    {
        self.register(
            Matcher::builder(MatchKind::Custom(name.into())).handler_sync(move |ev, _p| {
                if let Some(e) = ev.as_custom_mut() {
                    f(e);
                }
                Ok(())
            }),
        );
    }

    /// Builder entry point for handlers that declare injected parameters.
    pub fn matcher(kind: MatchKind) -> MatcherBuilder {
        Matcher::builder(kind)
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Fire every matcher registered for the event's kind, in registration
    /// order.
    ///
    /// Returns `Err` only for re-raised factory errors (the turn's
    /// `exception_ignored` kinds) and configuration errors; everything else
    /// lands in the report so the engine can continue with the turn.
    pub async fn dispatch(
        &self,
        event: &mut HookEvent,
        args: &HookArgs,
        kwargs: &HookKwargs,
        exception_ignored: &[String],
    ) -> Result<DispatchReport, HookError> {
        // Snapshot so handlers may register further matchers without
        // deadlocking; additions become visible on the next dispatch.
        let matchers: Vec<Matcher> = self
            .matchers
            .read()
            .expect("hook lock poisoned")
            .iter()
            .filter(|m| m.kind.matches(event))
            .cloned()
            .collect();

        let mut report = DispatchReport::default();
        for matcher in matchers {
            match matcher.bind(args, kwargs, exception_ignored).await {
                BindOutcome::Bound(params) => {
                    match (matcher.handler)(event, &params).await {
                        Ok(()) => report.fired += 1,
                        Err(e) => {
                            warn!(error = %e, "hook handler failed; continuing dispatch");
                            report.errors.push(e);
                        }
                    }
                }
                BindOutcome::Skip(reason) => {
                    tracing::debug!(%reason, "matcher skipped");
                    report.skipped += 1;
                }
                BindOutcome::Error(e) => {
                    warn!(error = %e, "dependency resolution failed; matcher skipped");
                    report.skipped += 1;
                    report.errors.push(e);
                }
                BindOutcome::Raise(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

/// The process-wide default hook registry.
pub fn global_hooks() -> &'static Arc<HookRegistry> {
    static GLOBAL: OnceLock<Arc<HookRegistry>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(HookRegistry::new()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
