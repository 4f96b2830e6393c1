// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
mod registry;
mod schema;
mod simple;
mod tool;

pub use registry::{global_tools, MultiToolsManager, ToolsManager};
pub use schema::{
    validate_args, FunctionDefinitionSchema, ParamType, ParametersSchema, PropertySchema,
    SchemaViolation,
};
pub use simple::{simple_tool, SimpleParam, SimpleType};
pub use tool::{ActiveContext, Tool, ToolContext, ToolReturn};

pub use builtin::agent_stop::{AgentStopTool, AGENT_STOP};
pub use builtin::processing_message::{ProcessingMessageTool, PROCESSING_ACK, PROCESSING_MESSAGE};
pub use builtin::think_and_reason::{ThinkAndReasonTool, THINK_AND_REASON};
