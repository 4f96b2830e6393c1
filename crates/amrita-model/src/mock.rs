// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::adapter::{AdapterError, AdapterStream, ModelAdapter, StreamItem};
use crate::types::{Message, Role, ToolCall, ToolSchema, UniResponse};

/// Deterministic mock adapter for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockAdapter;

#[async_trait]
impl ModelAdapter for MockAdapter {
    fn protocol(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn call_api(
        &self,
        messages: Vec<Message>,
        _tools: Vec<ToolSchema>,
    ) -> Result<AdapterStream, AdapterError> {
        let reply = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.as_text())
            .unwrap_or_else(|| "[no input]".into());
        let text = format!("MOCK: {reply}");
        let items = vec![
            Ok(StreamItem::Chunk(text.clone())),
            Ok(StreamItem::Final(UniResponse::text(text))),
        ];
        Ok(Box::pin(stream::iter(items)))
    }
}

/// One scripted adapter call.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// Emit these items in order.
    Respond(Vec<StreamItem>),
    /// Fail the call outright (exercises the fallback path).
    Fail(String),
}

/// A pre-scripted adapter.  Each `call_api` pops the next script from the
/// front of the queue, so tests can specify exact multi-round event
/// sequences — including tool calls and failures — without network access.
pub struct ScriptedMockAdapter {
    scripts: Mutex<Vec<ScriptedCall>>,
    calls: AtomicUsize,
    /// The last `(messages, tools)` pair seen, for request inspection.
    pub last_request: Mutex<Option<(Vec<Message>, Vec<ToolSchema>)>>,
}

impl ScriptedMockAdapter {
    pub fn new(scripts: Vec<ScriptedCall>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Single call: stream `chunks` then finalize with `final_text`.
    pub fn text(chunks: &[&str], final_text: impl Into<String>) -> Self {
        Self::new(vec![ScriptedCall::respond_text(chunks, final_text)])
    }

    /// Two calls: a tool-call round followed by a text round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptedCall::respond_tool_calls(vec![ToolCall::function(
                tool_id, tool_name, args_json,
            )]),
            ScriptedCall::respond_text(&[], final_text),
        ])
    }

    /// Number of `call_api` invocations so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ScriptedCall {
    /// Script item: stream `chunks` then a text-only terminal response whose
    /// content is `final_text`.
    pub fn respond_text(chunks: &[&str], final_text: impl Into<String>) -> Self {
        let mut items: Vec<StreamItem> = chunks
            .iter()
            .map(|c| StreamItem::Chunk((*c).to_string()))
            .collect();
        items.push(StreamItem::Final(UniResponse::text(final_text)));
        Self::Respond(items)
    }

    /// Script item: a terminal response requesting `tool_calls`, no text.
    pub fn respond_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self::Respond(vec![StreamItem::Final(UniResponse::with_tool_calls(
            "", tool_calls,
        ))])
    }
}

#[async_trait]
impl ModelAdapter for ScriptedMockAdapter {
    fn protocol(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn call_api(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSchema>,
    ) -> Result<AdapterStream, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some((messages, tools));
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                ScriptedCall::respond_text(&[], "[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        match script {
            ScriptedCall::Fail(msg) => Err(AdapterError::Request(msg)),
            ScriptedCall::Respond(items) => {
                let wrapped: Vec<Result<StreamItem, AdapterError>> =
                    items.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
