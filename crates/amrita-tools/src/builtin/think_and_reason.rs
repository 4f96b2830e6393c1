// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use crate::schema::{FunctionDefinitionSchema, ParametersSchema, PropertySchema};
use crate::tool::{Tool, ToolReturn};

pub const THINK_AND_REASON: &str = "think_and_reason";

/// Records an explicit reasoning step.
///
/// The content comes straight back as the tool result so the model sees its
/// own reasoning in context; the loop continues normally afterwards.
pub struct ThinkAndReasonTool;

#[async_trait]
impl Tool for ThinkAndReasonTool {
    fn schema(&self) -> FunctionDefinitionSchema {
        FunctionDefinitionSchema::new(
            THINK_AND_REASON,
            "Think step by step before acting. Write out your reasoning about \
             the task, then continue with tool calls or your answer.",
        )
        .with_parameters(ParametersSchema::default().with_property(
            "content",
            PropertySchema::string("the reasoning text"),
            true,
        ))
    }

    fn is_reasoning(&self) -> bool {
        true
    }

    fn is_builtin(&self) -> bool {
        true
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReturn> {
        let content = args["content"].as_str().unwrap_or("").to_string();
        Ok(ToolReturn::Text(content))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
