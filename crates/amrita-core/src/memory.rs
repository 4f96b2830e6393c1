// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use amrita_model::{Message, Role};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The conversation memory of one session.
///
/// Invariants:
/// - `messages` is chronological.
/// - Every `tool` message answers a `tool_calls` entry of an earlier
///   assistant message (see [`check_tool_linkage`](Self::check_tool_linkage)).
/// - `abstract_text` is authoritative for anything compacted away.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryModel {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Seconds since the epoch of the last mutation.
    #[serde(default)]
    pub time: f64,
    /// Running summary of compacted history.  Empty until the first
    /// compression pass.
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
}

impl MemoryModel {
    pub fn new() -> Self {
        let mut m = Self::default();
        m.touch();
        m
    }

    pub fn touch(&mut self) {
        self.time = Utc::now().timestamp_millis() as f64 / 1000.0;
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.touch();
    }

    /// Count of non-system messages — the `L` of the compression policy.
    pub fn non_system_len(&self) -> usize {
        self.messages.iter().filter(|m| m.role != Role::System).count()
    }

    /// Approximate total token count of the window (4-chars-per-token).
    pub fn approx_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.approx_tokens()).sum()
    }

    /// Verify that every tool message answers a tool call announced by an
    /// earlier assistant message.
    pub fn check_tool_linkage(&self) -> Result<(), String> {
        let mut announced: Vec<&str> = Vec::new();
        for (i, msg) in self.messages.iter().enumerate() {
            match msg.role {
                Role::Assistant => {
                    announced.extend(msg.tool_calls.iter().map(|tc| tc.id.as_str()));
                }
                Role::Tool => {
                    let id = msg
                        .tool_call_id
                        .as_deref()
                        .ok_or_else(|| format!("tool message at index {i} has no tool_call_id"))?;
                    if !announced.contains(&id) {
                        return Err(format!(
                            "tool message at index {i} answers unknown call id {id}"
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use amrita_model::ToolCall;

    use super::*;

    #[test]
    fn new_memory_is_empty_with_timestamp() {
        let m = MemoryModel::new();
        assert!(m.messages.is_empty());
        assert!(m.time > 0.0);
        assert!(m.abstract_text.is_empty());
    }

    #[test]
    fn push_appends_and_touches() {
        let mut m = MemoryModel::new();
        let before = m.time;
        m.push(Message::user("hi"));
        assert_eq!(m.messages.len(), 1);
        assert!(m.time >= before);
    }

    #[test]
    fn non_system_len_skips_system_messages() {
        let mut m = MemoryModel::new();
        m.push(Message::system("prompt"));
        m.push(Message::user("a"));
        m.push(Message::assistant("b"));
        assert_eq!(m.non_system_len(), 2);
    }

    // ── Tool linkage (every tool message answers an earlier call) ─────────────

    #[test]
    fn linked_tool_message_passes() {
        let mut m = MemoryModel::new();
        m.push(Message::user("q"));
        m.push(Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::function("t1", "echo", "{}")],
        ));
        m.push(Message::tool_result("echo", "out", "t1"));
        assert!(m.check_tool_linkage().is_ok());
    }

    #[test]
    fn orphan_tool_message_fails() {
        let mut m = MemoryModel::new();
        m.push(Message::tool_result("echo", "out", "ghost"));
        assert!(m.check_tool_linkage().is_err());
    }

    #[test]
    fn tool_message_may_lag_behind_its_call() {
        let mut m = MemoryModel::new();
        m.push(Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::function("t1", "echo", "{}")],
        ));
        m.push(Message::assistant("interleaved note"));
        m.push(Message::tool_result("echo", "out", "t1"));
        assert!(m.check_tool_linkage().is_ok());
    }

    // ── Serialization round-trip ──────────────────────────────────────────────

    #[test]
    fn memory_round_trips_through_json() {
        let mut m = MemoryModel::new();
        m.push(Message::user("hello"));
        m.push(Message::assistant("world"));
        m.abstract_text = "earlier: greetings".into();
        let json = serde_json::to_string(&m).unwrap();
        let back: MemoryModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn abstract_field_serializes_under_its_wire_name() {
        let mut m = MemoryModel::new();
        m.abstract_text = "summary".into();
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["abstract"], "summary");
    }

    #[test]
    fn approx_tokens_sums_messages() {
        let mut m = MemoryModel::new();
        m.push(Message::user("12345678")); // 2 tokens
        m.push(Message::user("1234"));     // 1 token
        assert_eq!(m.approx_tokens(), 3);
    }
}
