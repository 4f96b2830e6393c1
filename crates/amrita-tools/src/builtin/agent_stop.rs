// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use crate::schema::{FunctionDefinitionSchema, ParametersSchema, PropertySchema};
use crate::tool::{Tool, ToolReturn};

pub const AGENT_STOP: &str = "agent_stop";

/// Terminates the agent loop: the engine intercepts this call by name and
/// emits the final assistant answer instead of iterating further.
///
/// The optional `result` argument is a short closing summary recorded as the
/// call's tool result.
pub struct AgentStopTool;

#[async_trait]
impl Tool for AgentStopTool {
    fn schema(&self) -> FunctionDefinitionSchema {
        FunctionDefinitionSchema::new(
            AGENT_STOP,
            "Stop working and deliver the final answer to the user. \
             Call this when the task is complete.",
        )
        .with_parameters(ParametersSchema::default().with_property(
            "result",
            PropertySchema::string("optional short summary of the outcome"),
            false,
        ))
    }

    fn is_builtin(&self) -> bool {
        true
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReturn> {
        let result = args["result"].as_str().unwrap_or("").to_string();
        Ok(ToolReturn::Text(result))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
