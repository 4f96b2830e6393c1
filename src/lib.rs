// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime core of the Amrita agent framework.
//!
//! One user turn flows through a reasoning/tool-use loop against a
//! chat-completion model: the engine builds the request from session memory,
//! coordinates hooks, streams output with backpressure, dispatches
//! schema-validated tools and commits the conversation memory atomically —
//! compressing it when it outgrows the configured window.
//!
//! Typical setup:
//!
//! ```no_run
//! use amrita::prelude::*;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! amrita::init();
//! amrita::set_config(AmritaConfig::default())?;
//! amrita::load_amrita().await?;
//!
//! let sessions = global_sessions();
//! let session_id = sessions.new_session(None).await;
//! {
//!     let session = sessions.get(&session_id).await?;
//!     let data = session.lock().await;
//!     data.presets.add(ModelPreset::new(
//!         "default", "gpt-4o", "https://api.openai.com/v1", "openai",
//!     ));
//!     data.presets.set_default("default")?;
//! }
//!
//! let turn = ChatTurn::builder(&session_id, "Say hi").build().await?;
//! turn.begin()?;
//! println!("{}", turn.full_response().await?);
//! # Ok(())
//! # }
//! ```

use std::sync::Once;

use tracing::debug;

pub use amrita_config::{
    config as get_config, set_config, AgentThoughtMode, AmritaConfig, ConfigError, CookieConfig,
    FunctionConfig, LLMConfig, ToolCallingMode,
};
pub use amrita_core::{
    compress_memory, global_sessions, mcp_connector, set_mcp_connector, AmritaError, ChatTurn,
    ChatTurnBuilder, McpClient, McpConnector, MemoryModel, ResponseQueue, SessionData,
    SessionRegistry,
};
pub use amrita_hooks::{
    global_hooks, BoundParams, CompletionEvent, CustomEvent, Depends, FallbackContext, HookEvent,
    HookRegistry, HookValue, Matcher, MatcherBuilder, MatchKind, PreCompletionEvent, TurnHandle,
};
pub use amrita_model::{
    global_protocols, AdapterError, Message, MessageContent, MockAdapter, ModelAdapter,
    ModelConfig, ModelPreset, OpenAiCompatAdapter, PresetRegistry, ProtocolRegistry, Role,
    ScriptedCall, ScriptedMockAdapter, StreamItem, ToolCall, UniResponse, Usage,
};
pub use amrita_tools::{
    global_tools, simple_tool, AgentStopTool, FunctionDefinitionSchema, MultiToolsManager,
    ProcessingMessageTool, SimpleParam, SimpleType, ThinkAndReasonTool, Tool, ToolContext,
    ToolReturn, ToolsManager,
};

/// Frequently used surface in one import.
pub mod prelude {
    pub use crate::{
        get_config, global_hooks, global_protocols, global_sessions, global_tools, init,
        load_amrita, set_config, AmritaConfig, AmritaError, ChatTurn, Depends, HookValue, Message,
        ModelPreset, Role, UniResponse,
    };
}

/// Prepare the runtime: logging, built-in tools and the reference adapter
/// protocol.  Idempotent — later calls are no-ops.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // The host may have installed its own subscriber already; that is
        // fine, we only provide a default.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        let tools = global_tools();
        tools.register(std::sync::Arc::new(AgentStopTool));
        tools.register(std::sync::Arc::new(ThinkAndReasonTool));
        tools.register(std::sync::Arc::new(ProcessingMessageTool));

        global_protocols()
            .register(
                &["openai", "openai-compatible"],
                |preset| {
                    let adapter: std::sync::Arc<dyn ModelAdapter> =
                        std::sync::Arc::new(OpenAiCompatAdapter::from_preset(preset)?);
                    Ok(adapter)
                },
                true,
            )
            .expect("override registration cannot conflict");

        debug!("amrita runtime initialized");
    });
}

/// Finish async setup: verify a config is installed and materialize MCP
/// clients for already-created sessions that requested them.  Must follow
/// [`set_config`].
pub async fn load_amrita() -> Result<(), AmritaError> {
    let _ = get_config()?;
    let sessions = global_sessions();
    for id in sessions.list().await {
        sessions.init(&id).await?;
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_registers_builtins() {
        init();
        init();
        init();
        let names = global_tools().names();
        assert!(names.contains(&"agent_stop".to_string()));
        assert!(names.contains(&"think_and_reason".to_string()));
        assert!(names.contains(&"processing_message".to_string()));
    }

    #[test]
    fn init_binds_the_reference_protocol() {
        init();
        let preset = ModelPreset::new("p", "m", "http://localhost:9/v1", "openai");
        assert!(global_protocols().resolve(&preset).is_ok());
        let alias = ModelPreset::new("p", "m", "http://localhost:9/v1", "openai-compatible");
        assert!(global_protocols().resolve(&alias).is_ok());
    }

    #[tokio::test]
    async fn load_amrita_requires_config() {
        init();
        // The global config may have been installed by a sibling test; only
        // assert the NotInitialized path when it is actually absent.
        if get_config().is_err() {
            assert!(load_amrita().await.is_err());
        }
        set_config(AmritaConfig::default()).unwrap();
        load_amrita().await.unwrap();
    }
}
