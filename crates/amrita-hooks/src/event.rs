// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use amrita_config::AmritaConfig;
use amrita_model::{Message, ModelPreset, UniResponse};
use tokio::sync::mpsc;

/// Lightweight handle onto a running chat turn.
///
/// Handed to hook handlers (`chat_object`) and custom-run tools so they can
/// identify the turn and stream side responses into its sink.  Holders must
/// not retain it past their invocation; the turn owns the receiving end.
#[derive(Clone)]
pub struct TurnHandle {
    pub stream_id: String,
    pub session_id: String,
    responses: mpsc::Sender<String>,
}

impl TurnHandle {
    pub fn new(
        stream_id: impl Into<String>,
        session_id: impl Into<String>,
        responses: mpsc::Sender<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            session_id: session_id.into(),
            responses,
        }
    }

    /// Stream a side-response chunk to the turn's consumer.
    ///
    /// Returns `false` when the turn has already finished and the chunk was
    /// dropped.
    pub async fn yield_response(&self, chunk: impl Into<String>) -> bool {
        self.responses.send(chunk.into()).await.is_ok()
    }
}

impl std::fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnHandle")
            .field("stream_id", &self.stream_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Fired before each adapter call.  Handlers may rewrite `messages`; the
/// engine sends whatever is left in the event afterwards.
#[derive(Debug)]
pub struct PreCompletionEvent {
    pub messages: Vec<Message>,
    pub turn: TurnHandle,
}

/// Fired after each terminal adapter response, before tool dispatch.
#[derive(Debug)]
pub struct CompletionEvent {
    pub response: UniResponse,
    pub turn: TurnHandle,
}

/// Fired when an adapter call fails.  Handlers may swap `preset` to retry on
/// a different endpoint, or call [`fail`](Self::fail) to abort the turn.
#[derive(Debug)]
pub struct FallbackContext {
    pub preset: ModelPreset,
    /// Rendered error that triggered the fallback.
    pub error: String,
    pub config: Arc<AmritaConfig>,
    /// Zero-based retry counter: 0 on the first failure.
    pub term: u32,
    failed: Option<String>,
}

impl FallbackContext {
    pub fn new(preset: ModelPreset, error: String, config: Arc<AmritaConfig>, term: u32) -> Self {
        Self {
            preset,
            error,
            config,
            term,
            failed: None,
        }
    }

    /// Abort the turn: no further retries, the engine surfaces
    /// `FallbackFailed` with `reason`.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failed = Some(reason.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failed.as_deref()
    }
}

/// User-defined event routed by name.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

impl CustomEvent {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// The event taxonomy dispatched through the hook registry.
///
/// Events are mutable records passed by reference through the matcher chain;
/// handler ordering is observable (earlier handlers see and shape what later
/// handlers get).
#[derive(Debug)]
pub enum HookEvent {
    PreCompletion(PreCompletionEvent),
    Completion(CompletionEvent),
    PresetFallback(FallbackContext),
    Custom(CustomEvent),
}

impl HookEvent {
    pub fn kind(&self) -> MatchKind {
        match self {
            Self::PreCompletion(_) => MatchKind::PreCompletion,
            Self::Completion(_) => MatchKind::Completion,
            Self::PresetFallback(_) => MatchKind::PresetFallback,
            Self::Custom(e) => MatchKind::Custom(e.name.clone()),
        }
    }

    pub fn as_pre_completion_mut(&mut self) -> Option<&mut PreCompletionEvent> {
        match self {
            Self::PreCompletion(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_completion_mut(&mut self) -> Option<&mut CompletionEvent> {
        match self {
            Self::Completion(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_fallback_mut(&mut self) -> Option<&mut FallbackContext> {
        match self {
            Self::PresetFallback(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_custom_mut(&mut self) -> Option<&mut CustomEvent> {
        match self {
            Self::Custom(e) => Some(e),
            _ => None,
        }
    }
}

/// The event kind a matcher subscribes to.  Custom matchers route by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    PreCompletion,
    Completion,
    PresetFallback,
    Custom(String),
}

impl MatchKind {
    pub fn matches(&self, event: &HookEvent) -> bool {
        match (self, event) {
            (Self::PreCompletion, HookEvent::PreCompletion(_)) => true,
            (Self::Completion, HookEvent::Completion(_)) => true,
            (Self::PresetFallback, HookEvent::PresetFallback(_)) => true,
            (Self::Custom(name), HookEvent::Custom(e)) => *name == e.name,
            _ => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
