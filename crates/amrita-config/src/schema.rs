// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so config fields that should be on unless the user
/// explicitly disables them need a named function.
fn default_true() -> bool {
    true
}

fn default_max_tool_calls() -> u32 {
    10
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_s() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_memory_length_limit() -> usize {
    40
}

fn default_abstract_proportion() -> f32 {
    0.25
}

/// How the chat turn engine exposes tools to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallingMode {
    /// Full agent loop: every enabled tool, unlimited invocations per turn
    /// (bounded only by `agent_max_tool_calls`).
    #[default]
    Agent,
    /// Retrieval mode: tools are offered once; after the first invocation the
    /// tool list is withdrawn for the rest of the turn.
    Rag,
    /// No tools are ever sent to the model.
    None,
}

/// Reasoning discipline applied by the engine within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentThoughtMode {
    /// Inject a system directive telling the model to think first by calling
    /// the reasoning tool before acting.
    Reasoning,
    /// Plain chat: reasoning tools are hidden from the tool list entirely.
    #[default]
    Chat,
    /// Every tool-calling iteration must include a reasoning call; iterations
    /// that do not are rejected with a corrective tool result and the loop
    /// continues.
    ReasoningRequired,
    /// Reasoning tools are offered but never enforced.
    ReasoningOptional,
}

/// Feature switches for the agent loop and tool dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// When true, requests carry only the system prompts plus the last user
    /// message instead of the full conversation window.
    #[serde(default)]
    pub use_minimal_context: bool,
    #[serde(default)]
    pub tool_calling_mode: ToolCallingMode,
    #[serde(default)]
    pub agent_thought_mode: AgentThoughtMode,
    /// Materialize MCP clients on session init.
    #[serde(default)]
    pub agent_mcp_client_enable: bool,
    /// Server scripts handed to the registered MCP connector, one client each.
    #[serde(default)]
    pub agent_mcp_server_scripts: Vec<String>,
    /// Stream assistant text produced by intermediate (tool-calling) loop
    /// iterations.  When false, only the final iteration's text reaches the
    /// consumer.
    #[serde(default = "default_true")]
    pub agent_middle_message: bool,
    /// Upper bound on non-built-in tool invocations within one turn.
    #[serde(default = "default_max_tool_calls")]
    pub agent_max_tool_calls: u32,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            use_minimal_context: false,
            tool_calling_mode: ToolCallingMode::default(),
            agent_thought_mode: AgentThoughtMode::default(),
            agent_mcp_client_enable: false,
            agent_mcp_server_scripts: Vec::new(),
            agent_middle_message: true,
            agent_max_tool_calls: default_max_tool_calls(),
        }
    }
}

/// Model-call budget, retry and conversation-memory policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Deadline for one adapter call, in seconds.
    #[serde(default = "default_timeout_s")]
    pub llm_timeout_s: u64,
    /// Retry through the fallback path on adapter errors.
    #[serde(default = "default_true")]
    pub auto_retry: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Non-system message count that triggers compression.  `0` disables
    /// compression entirely.
    #[serde(default = "default_memory_length_limit")]
    pub memory_length_limit: usize,
    #[serde(default = "default_true")]
    pub enable_memory_abstract: bool,
    /// Fraction of `memory_length_limit` summarized away per compression
    /// pass.  Must lie in `(0, 1]`.
    #[serde(default = "default_abstract_proportion")]
    pub memory_abstract_proportion: f32,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            llm_timeout_s: default_timeout_s(),
            auto_retry: true,
            max_retries: default_max_retries(),
            memory_length_limit: default_memory_length_limit(),
            enable_memory_abstract: true,
            memory_abstract_proportion: default_abstract_proportion(),
        }
    }
}

/// Prompt-injection canary configuration.
///
/// When enabled, the engine plants the cookie marker in a dedicated system
/// message and scans user-visible output for it after each turn.  A hit means
/// system context leaked into the response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieConfig {
    #[serde(default)]
    pub enable_cookie: bool,
    /// Opaque marker string.  Auto-randomized at config install time when
    /// enabled and left empty.
    #[serde(default)]
    pub cookie: String,
}

/// Aggregate runtime configuration.
///
/// One instance is installed process-wide via [`crate::set_config`]; sessions
/// may carry their own overriding copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmritaConfig {
    #[serde(default)]
    pub function: FunctionConfig,
    #[serde(default)]
    pub llm: LLMConfig,
    #[serde(default)]
    pub cookie: CookieConfig,
}

impl AmritaConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let p = self.llm.memory_abstract_proportion;
        if !(p > 0.0 && p <= 1.0) {
            return Err(format!(
                "memory_abstract_proportion must be in (0, 1], got {p}"
            ));
        }
        if self.llm.auto_retry && self.llm.max_retries == 0 {
            return Err("auto_retry requires max_retries >= 1".into());
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
