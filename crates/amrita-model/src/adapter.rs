// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::types::{Message, ToolSchema, UniResponse};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("{provider} error {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("response decode failed: {0}")]
    Decode(String),
    #[error("model call timed out after {0}s")]
    Timeout(u64),
    #[error("unknown adapter protocol: {0}")]
    UnknownProtocol(String),
    #[error("adapter protocol already registered: {0}")]
    ProtocolConflict(String),
    #[error("stream ended without a terminal response")]
    MissingFinal,
}

/// One element of an adapter response stream.
///
/// A well-formed stream yields zero or more `Chunk`s (incremental assistant
/// text, never tool-call JSON fragments) followed by exactly one `Final`
/// carrying the assembled content, usage statistics and any tool calls.
/// Non-streaming presets yield the `Final` only.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Chunk(String),
    Final(UniResponse),
}

pub type AdapterStream = Pin<Box<dyn Stream<Item = Result<StreamItem, AdapterError>> + Send>>;

/// Provider-specific implementation of the streaming chat-completion
/// contract.  Constructed from a [`crate::ModelPreset`] by the constructor
/// bound in the protocol registry.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Protocol tag this adapter was registered under.
    fn protocol(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the lazy response sequence.
    async fn call_api(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSchema>,
    ) -> Result<AdapterStream, AdapterError>;
}

/// Drive an adapter call to completion and return the terminal response.
///
/// Convenience for callers that do not stream (memory summarization, tests).
/// Verifies the contract: chunks concatenated must be reflected in the final
/// content; a stream that ends without a `Final` is a protocol violation.
pub async fn call_and_collect(
    adapter: &dyn ModelAdapter,
    messages: Vec<Message>,
    tools: Vec<ToolSchema>,
) -> Result<UniResponse, AdapterError> {
    let mut stream = adapter.call_api(messages, tools).await?;
    while let Some(item) = stream.next().await {
        if let StreamItem::Final(resp) = item? {
            return Ok(resp);
        }
    }
    Err(AdapterError::MissingFinal)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedMockAdapter;
    use crate::types::Message;

    #[tokio::test]
    async fn call_and_collect_returns_terminal_response() {
        let adapter = ScriptedMockAdapter::text(&["Hi", "!"], "Hi!");
        let resp = call_and_collect(&adapter, vec![Message::user("hey")], vec![])
            .await
            .unwrap();
        assert_eq!(resp.content, "Hi!");
    }

    #[tokio::test]
    async fn call_and_collect_without_final_is_an_error() {
        let adapter = ScriptedMockAdapter::new(vec![crate::mock::ScriptedCall::Respond(vec![
            StreamItem::Chunk("dangling".into()),
        ])]);
        let err = call_and_collect(&adapter, vec![Message::user("x")], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingFinal));
    }
}
