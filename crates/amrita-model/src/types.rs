// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Used for user messages that mix text with images.  Images are carried as
/// URLs (data URLs or HTTPS) and forwarded verbatim to the adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::Image { url: url.into() }
    }
}

/// The content of a message: a plain string for most messages, structured
/// parts for multimodal user turns.
///
/// Untagged so that a bare JSON string and a part array both deserialize;
/// single-text part lists are collapsed to `Text` at construction time for
/// compatibility with providers that reject one-element arrays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Plain text of this content, flattening text parts.  Image parts are
    /// omitted.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model, in function-calling wire form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".into()
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    /// Tool invocations requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Present on `Role::Tool` messages: the id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Present on `Role::Tool` messages: the tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Construct a user message from content parts.
    ///
    /// Empty lists fall back to empty text; single text parts collapse to
    /// plain `Text` for cleaner serialization.
    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.is_empty() {
            MessageContent::Text(String::new())
        } else if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::Parts(parts)
            }
        } else {
            MessageContent::Parts(parts)
        };
        Self {
            role: Role::User,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message carrying both streamed text and requested tool calls.
    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Tool-result message answering `tool_call_id`.
    pub fn tool_result(
        name: impl Into<String>,
        content: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    /// An assistant message is invalid when it carries neither content nor
    /// tool calls — there is nothing for the consumer or the loop to act on.
    pub fn is_valid(&self) -> bool {
        if self.role == Role::Assistant {
            return !(self.content.is_empty() && self.tool_calls.is_empty());
        }
        true
    }

    pub fn as_text(&self) -> String {
        self.content.as_text()
    }

    /// Approximate token count (4-chars-per-token heuristic), used for
    /// memory statistics.  Tool calls count their name plus arguments.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { .. } => 765 * 4,
                })
                .sum(),
        };
        for tc in &self.tool_calls {
            chars += tc.function.name.len() + tc.function.arguments.len();
        }
        (chars / 4).max(1)
    }
}

// ─── Responses ────────────────────────────────────────────────────────────────

/// Token usage reported by the provider for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// The provider-agnostic terminal response of one adapter call.
///
/// `content` is the fully assembled assistant text (equal to the
/// concatenation of all streamed chunks); `tool_calls` carries any function
/// invocations the model requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UniResponse {
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

fn assistant_role() -> String {
    "assistant".into()
}

impl UniResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: assistant_role(),
            content: content.into(),
            usage: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: assistant_role(),
            content: content.into(),
            usage: None,
            tool_calls,
        }
    }

    /// Convert into the assistant [`Message`] appended to memory.
    pub fn to_message(&self) -> Message {
        Message::assistant_with_tool_calls(self.content.clone(), self.tool_calls.clone())
    }
}

impl Default for UniResponse {
    fn default() -> Self {
        Self::text("")
    }
}

/// A tool schema as sent to the adapter — mirrors the tools crate's
/// definition records but keeps this crate independent of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), "hello");
    }

    #[test]
    fn tool_result_sets_linkage_fields() {
        let m = Message::tool_result("echo", "out", "call-1");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(m.name.as_deref(), Some("echo"));
        assert_eq!(m.as_text(), "out");
    }

    #[test]
    fn user_with_single_text_part_collapses() {
        let m = Message::user_with_parts(vec![ContentPart::text("hi")]);
        assert!(matches!(m.content, MessageContent::Text(ref t) if t == "hi"));
    }

    #[test]
    fn user_with_image_part_stays_structured() {
        let m = Message::user_with_parts(vec![
            ContentPart::text("what is this?"),
            ContentPart::image("https://example.com/x.png"),
        ]);
        assert!(matches!(m.content, MessageContent::Parts(ref p) if p.len() == 2));
    }

    // ── Validity ──────────────────────────────────────────────────────────────

    #[test]
    fn empty_assistant_without_tool_calls_is_invalid() {
        let m = Message::assistant("");
        assert!(!m.is_valid());
    }

    #[test]
    fn empty_assistant_with_tool_calls_is_valid() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::function("t1", "echo", "{}")],
        );
        assert!(m.is_valid());
    }

    #[test]
    fn empty_user_message_is_valid() {
        assert!(Message::user("").is_valid());
    }

    // ── Serde ─────────────────────────────────────────────────────────────────

    #[test]
    fn plain_text_content_serializes_as_bare_string() {
        let json = serde_json::to_value(Message::user("hey")).unwrap();
        assert_eq!(json["content"], "hey");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn message_round_trips() {
        let m = Message::assistant_with_tool_calls(
            "calling",
            vec![ToolCall::function("t1", "echo", r#"{"x":1}"#)],
        );
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn tool_call_type_defaults_to_function() {
        let json = r#"{"id":"a","function":{"name":"f","arguments":"{}"}}"#;
        let tc: ToolCall = serde_json::from_str(json).unwrap();
        assert_eq!(tc.call_type, "function");
    }

    #[test]
    fn structured_parts_round_trip() {
        let m = Message::user_with_parts(vec![
            ContentPart::text("a"),
            ContentPart::image("data:image/png;base64,AA"),
        ]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_divides_by_four() {
        assert_eq!(Message::user("12345678").approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(Message::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_counts_tool_call_payloads() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::function("id", "aaaa", "bbbbbbbb")],
        );
        // 4 + 8 chars -> 3 tokens
        assert_eq!(m.approx_tokens(), 3);
    }

    // ── UniResponse ───────────────────────────────────────────────────────────

    #[test]
    fn uni_response_to_message_preserves_tool_calls() {
        let r = UniResponse::with_tool_calls("go", vec![ToolCall::function("1", "f", "{}")]);
        let m = r.to_message();
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.as_text(), "go");
        assert_eq!(m.tool_calls.len(), 1);
    }

    #[test]
    fn uni_response_role_defaults_to_assistant() {
        let r: UniResponse = serde_json::from_str(r#"{"content":"x"}"#).unwrap();
        assert_eq!(r.role, "assistant");
    }
}
