// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Reference adapter for OpenAI-compatible chat completion APIs.
//!
//! Speaks the `/chat/completions` wire format in both its streaming (SSE)
//! and single-JSON forms.  Nearly every hosted or local provider exposes this
//! surface, so one adapter registered under the `"openai"` tag covers the
//! default deployment story; other protocols plug in through the registry.
//!
//! Streaming notes:
//! - SSE events can be split across TCP packets; a persistent line buffer is
//!   maintained and only complete `\n`-terminated lines are parsed.
//! - Tool-call argument deltas are accumulated per `index` and surface only
//!   in the terminal [`StreamItem::Final`] — consumers never see tool-call
//!   JSON fragments as text chunks.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::adapter::{AdapterError, AdapterStream, ModelAdapter, StreamItem};
use crate::preset::ModelPreset;
use crate::types::{Message, ToolCall, ToolSchema, UniResponse, Usage};

pub struct OpenAiCompatAdapter {
    protocol: String,
    model: String,
    api_key: String,
    chat_url: String,
    stream: bool,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    /// Extra key-value pairs merged verbatim into the request body.
    extra_body: Value,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    /// Build an adapter from a preset.
    ///
    /// `max_tokens` comes from the installed config when one is present; the
    /// catalog default of 4096 applies otherwise so the adapter is usable in
    /// isolation.
    pub fn from_preset(preset: &ModelPreset) -> Result<Self, AdapterError> {
        let base = preset.base_url.trim_end_matches('/');
        let max_tokens = amrita_config::config()
            .map(|c| c.llm.max_tokens)
            .unwrap_or(4096);
        Ok(Self {
            protocol: preset.protocol.clone(),
            model: preset.model.clone(),
            api_key: preset.api_key.clone(),
            chat_url: format!("{base}/chat/completions"),
            stream: preset.config.stream,
            temperature: preset.config.temperature,
            top_p: preset.config.top_p,
            max_tokens,
            extra_body: preset.extra.clone(),
            client: reqwest::Client::new(),
        })
    }

    fn build_body(&self, messages: &[Message], tools: &[ToolSchema]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_wire_messages(messages),
            "stream": self.stream,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "max_tokens": self.max_tokens,
        });
        if !tools.is_empty() {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        // User-supplied extras win over computed keys so provider-specific
        // behaviour can be tuned without code changes.
        if let Some(map) = self.extra_body.as_object() {
            for (k, v) in map {
                body[k] = v.clone();
            }
        }
        body
    }
}

#[async_trait]
impl ModelAdapter for OpenAiCompatAdapter {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call_api(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSchema>,
    ) -> Result<AdapterStream, AdapterError> {
        let body = self.build_body(&messages, &tools);
        debug!(
            protocol = %self.protocol,
            model = %self.model,
            message_count = messages.len(),
            tool_count = tools.len(),
            stream = self.stream,
            "sending completion request"
        );

        let mut req = self.client.post(&self.chat_url).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AdapterError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Http {
                provider: self.protocol.clone(),
                status: status.as_u16(),
                body: text,
            });
        }

        if !self.stream {
            let body: Value = resp
                .json()
                .await
                .map_err(|e| AdapterError::Decode(e.to_string()))?;
            let response = parse_single_response(&body)?;
            return Ok(Box::pin(futures::stream::iter(vec![Ok(StreamItem::Final(
                response,
            ))])));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamItem, AdapterError>>(32);
        let mut byte_stream = resp.bytes_stream();
        tokio::spawn(async move {
            let mut buf = String::new();
            let mut acc = ResponseAccumulator::default();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(AdapterError::Request(e.to_string()))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                for line in drain_complete_lines(&mut buf) {
                    match parse_sse_data_line(&line) {
                        None => {}
                        Some(SseEvent::TextDelta(delta)) => {
                            acc.full_text.push_str(&delta);
                            if tx.send(Ok(StreamItem::Chunk(delta))).await.is_err() {
                                return;
                            }
                        }
                        Some(SseEvent::ToolCallDelta {
                            index,
                            id,
                            name,
                            arguments,
                        }) => acc.push_tool_delta(index, id, name, arguments),
                        Some(SseEvent::Usage(usage)) => acc.usage = Some(usage),
                        Some(SseEvent::Done) => {
                            let _ = tx.send(Ok(StreamItem::Final(acc.finish()))).await;
                            return;
                        }
                    }
                }
            }
            // Connection closed without a [DONE] terminator: finalize with
            // whatever was accumulated rather than losing the turn.
            warn!("SSE stream ended without [DONE]; finalizing partial response");
            let _ = tx.send(Ok(StreamItem::Final(acc.finish()))).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ─── Wire serialization ───────────────────────────────────────────────────────

/// Convert messages into the `/chat/completions` JSON array.
///
/// Our [`Message`] record is already wire-shaped (role, content,
/// `tool_calls`, `tool_call_id`, `name`); this keeps the mapping explicit so
/// an internal field can never leak onto the wire by accident.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut v = json!({
                "role": role_str(m),
                "content": serde_json::to_value(&m.content).unwrap_or(Value::Null),
            });
            if !m.tool_calls.is_empty() {
                v["tool_calls"] = serde_json::to_value(&m.tool_calls).unwrap_or(Value::Null);
            }
            if let Some(id) = &m.tool_call_id {
                v["tool_call_id"] = json!(id);
            }
            if let Some(name) = &m.name {
                v["name"] = json!(name);
            }
            v
        })
        .collect()
}

fn role_str(m: &Message) -> &'static str {
    match m.role {
        crate::types::Role::System => "system",
        crate::types::Role::User => "user",
        crate::types::Role::Assistant => "assistant",
        crate::types::Role::Tool => "tool",
    }
}

// ─── Response parsing ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ResponseAccumulator {
    full_text: String,
    pending: HashMap<u32, PendingToolCall>,
    usage: Option<Usage>,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl ResponseAccumulator {
    fn push_tool_delta(&mut self, index: u32, id: String, name: String, arguments: String) {
        let ptc = self.pending.entry(index).or_default();
        if !id.is_empty() {
            ptc.id = id;
        }
        if !name.is_empty() {
            ptc.name = name;
        }
        ptc.args_buf.push_str(&arguments);
    }

    fn finish(self) -> UniResponse {
        let mut pending: Vec<(u32, PendingToolCall)> = self.pending.into_iter().collect();
        pending.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::with_capacity(pending.len());
        for (i, (_, ptc)) in pending.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name from model");
                continue;
            }
            let id = if ptc.id.is_empty() {
                // Synthetic fallback so the turn can still complete.
                format!("tc_synthetic_{i}")
            } else {
                ptc.id
            };
            let args = if ptc.args_buf.is_empty() {
                "{}".to_string()
            } else {
                ptc.args_buf
            };
            tool_calls.push(ToolCall::function(id, ptc.name, args));
        }
        UniResponse {
            role: "assistant".into(),
            content: self.full_text,
            usage: self.usage,
            tool_calls,
        }
    }
}

enum SseEvent {
    TextDelta(String),
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage(Usage),
    Done,
}

/// Drain all complete `\n`-terminated lines from `buf`, leaving any trailing
/// incomplete line in place for the next TCP chunk to extend.
fn drain_complete_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        lines.push(line);
    }
    lines
}

/// Parse one complete SSE `data:` line.  Returns `None` for empty lines,
/// comments and unparseable payloads.
fn parse_sse_data_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(parse_sse_chunk(&v))
}

fn parse_sse_chunk(v: &Value) -> SseEvent {
    // Usage-only chunk (some providers send it just before [DONE]).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return SseEvent::Usage(parse_usage(usage));
    }

    let delta = &v["choices"][0]["delta"];

    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return SseEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        };
    }

    SseEvent::TextDelta(
        delta
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string(),
    )
}

fn parse_usage(usage: &Value) -> Usage {
    let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    let completion = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
    let total = usage["total_tokens"]
        .as_u64()
        .map(|t| t as u32)
        .unwrap_or(prompt + completion);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    }
}

/// Parse a non-streaming `/chat/completions` response body.
fn parse_single_response(body: &Value) -> Result<UniResponse, AdapterError> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| AdapterError::Decode("response has no choices[0].message".into()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in calls {
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"].as_str().unwrap_or("{}").to_string();
            if name.is_empty() {
                warn!(tool_call_id = %id, "dropping tool call with empty name from model");
                continue;
            }
            tool_calls.push(ToolCall::function(id, name, args));
        }
    }

    let usage = body.get("usage").filter(|u| !u.is_null()).map(parse_usage);

    Ok(UniResponse {
        role: "assistant".into(),
        content,
        usage,
        tool_calls,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
