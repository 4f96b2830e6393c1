// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use amrita_config::AmritaConfig;
use amrita_hooks::TurnHandle;
use async_trait::async_trait;
use serde_json::Value;

use crate::schema::FunctionDefinitionSchema;

/// What a tool invocation produced.
///
/// The dispatcher coerces everything that is not already text through JSON
/// serialization; `Nothing` (custom-run tools only) appends no tool-result
/// message at all.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolReturn {
    Text(String),
    Json(Value),
    Nothing,
}

impl ToolReturn {
    /// The tool-result message content, if any.
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(t) => Some(t),
            Self::Json(v) => Some(v.to_string()),
            Self::Nothing => None,
        }
    }
}

impl From<String> for ToolReturn {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolReturn {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Context supplied to conditional-enablement checks and the active-tool
/// listing.
#[derive(Clone)]
pub struct ActiveContext {
    pub session_id: Option<String>,
    pub config: Arc<AmritaConfig>,
}

impl ActiveContext {
    pub fn new(session_id: Option<String>, config: Arc<AmritaConfig>) -> Self {
        Self { session_id, config }
    }
}

/// Invocation context for custom-run tools.
///
/// Carries the parsed arguments plus a handle onto the running turn so the
/// tool can stream side responses to the consumer while it works.
pub struct ToolContext {
    pub call_id: String,
    pub args: Value,
    pub turn: TurnHandle,
}

/// Trait every built-in and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> FunctionDefinitionSchema;

    /// Custom-context mode: the dispatcher calls [`invoke_custom`]
    /// (with a [`ToolContext`]) instead of [`invoke`].
    fn custom_run(&self) -> bool {
        false
    }

    /// Reasoning tools are hidden from the model in `chat` thought mode.
    fn is_reasoning(&self) -> bool {
        false
    }

    /// Built-in tools do not count against `agent_max_tool_calls`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// Conditional enablement, re-evaluated on every listing.
    fn enabled(&self, _ctx: &ActiveContext) -> bool {
        true
    }

    /// Default invocation mode: schema-validated arguments in, result out.
    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReturn>;

    /// Custom-context invocation; only called when [`custom_run`] is true.
    async fn invoke_custom(&self, ctx: ToolContext) -> anyhow::Result<ToolReturn> {
        // Fall back to the plain path for tools that opted in by accident.
        self.invoke(ctx.args).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
