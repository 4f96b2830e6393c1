// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod depends;
mod event;
mod matcher;
mod registry;

pub use depends::{Depends, HookArgs, HookError, HookKwargs, HookValue, Injected, ResolveCtx};
pub use event::{
    CompletionEvent, CustomEvent, FallbackContext, HookEvent, MatchKind, PreCompletionEvent,
    TurnHandle,
};
pub use matcher::{BoundParams, Matcher, MatcherBuilder, ParamSource};
pub use registry::{global_hooks, DispatchReport, HookRegistry};
