// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use amrita_config::ConfigError;
use amrita_hooks::HookError;
use amrita_model::{AdapterError, PresetError};

/// Error taxonomy of the runtime core.
///
/// Turn-level policy: conditions with a loop-continuing alternative (tool
/// schema failures, reasoning enforcement misses, summarization failures)
/// are recovered inside the engine and never reach this type; what surfaces
/// here ends the operation that raised it.
#[derive(Debug, thiserror::Error)]
pub enum AmritaError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Preset(#[from] PresetError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("preset fallback failed: {0}")]
    FallbackFailed(String),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("turn was cancelled")]
    Cancelled,
    /// Summary form reported by [`crate::ChatTurn::wait`] when the failure
    /// object itself was already handed to the queue consumer.
    #[error("turn failed: {0}")]
    Failed(String),
    #[error("response stream already consumed")]
    AlreadyConsumed,
    #[error("turn delivers through a callback; no queue to consume")]
    CallbackMode,
    #[error("response queue is closed")]
    QueueClosed,
    #[error("{0}")]
    Invalid(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
