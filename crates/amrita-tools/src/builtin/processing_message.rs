// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use crate::schema::{FunctionDefinitionSchema, ParametersSchema, PropertySchema};
use crate::tool::{Tool, ToolContext, ToolReturn};

pub const PROCESSING_MESSAGE: &str = "processing_message";

/// Acknowledgement returned to the model after the message was streamed.
pub const PROCESSING_ACK: &str = "message delivered to the user";

/// Custom-run tool that streams a progress message to the user mid-turn.
///
/// The content goes out through the turn's response sink immediately; the
/// model only sees a fixed acknowledgement.
pub struct ProcessingMessageTool;

#[async_trait]
impl Tool for ProcessingMessageTool {
    fn schema(&self) -> FunctionDefinitionSchema {
        FunctionDefinitionSchema::new(
            PROCESSING_MESSAGE,
            "Show the user a short progress message while you keep working. \
             Use this during long multi-step tasks.",
        )
        .with_parameters(ParametersSchema::default().with_property(
            "content",
            PropertySchema::string("the progress message to show"),
            true,
        ))
    }

    fn custom_run(&self) -> bool {
        true
    }

    fn is_builtin(&self) -> bool {
        true
    }

    async fn invoke(&self, _args: Value) -> anyhow::Result<ToolReturn> {
        anyhow::bail!("{PROCESSING_MESSAGE} requires the custom-run invocation path")
    }

    async fn invoke_custom(&self, ctx: ToolContext) -> anyhow::Result<ToolReturn> {
        let content = ctx.args["content"].as_str().unwrap_or("").to_string();
        if !content.is_empty() {
            ctx.turn.yield_response(content).await;
        }
        Ok(ToolReturn::Text(PROCESSING_ACK.into()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
