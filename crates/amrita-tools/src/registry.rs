// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use amrita_config::{AgentThoughtMode, ToolCallingMode};
use tracing::debug;

use crate::tool::{ActiveContext, Tool};

/// One layer of registered tools.
#[derive(Default)]
pub struct ToolsManager {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous entry with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        debug!(%name, "registering tool");
        self.tools
            .write()
            .expect("tools lock poisoned")
            .insert(name, tool);
    }

    pub fn remove(&self, name: &str) {
        self.tools.write().expect("tools lock poisoned").remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().expect("tools lock poisoned").get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tools lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn snapshot(&self) -> Vec<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tools lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Layered registry: process-wide tools plus per-session additions.
///
/// Session entries shadow global ones with the same name so a session can
/// locally replace a tool without touching other sessions.
pub struct MultiToolsManager {
    global: Arc<ToolsManager>,
    session: ToolsManager,
}

impl MultiToolsManager {
    pub fn new(global: Arc<ToolsManager>) -> Self {
        Self {
            global,
            session: ToolsManager::new(),
        }
    }

    /// The session-local layer (MCP imports, per-session registrations).
    pub fn session_layer(&self) -> &ToolsManager {
        &self.session
    }

    /// Resolve a tool by name, session layer first.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.session.get(name).or_else(|| self.global.get(name))
    }

    /// The tool set offered to the model for the next request.
    ///
    /// Unions both layers, re-evaluates each tool's enablement, then applies
    /// `tool_calling_mode` (`none` yields an empty list) and hides reasoning
    /// tools in `chat` thought mode.  The `rag` one-invocation rule is
    /// enforced by the engine, which clears the list after the first call.
    pub fn list_active(&self, ctx: &ActiveContext) -> Vec<Arc<dyn Tool>> {
        if ctx.config.function.tool_calling_mode == ToolCallingMode::None {
            return Vec::new();
        }
        let hide_reasoning =
            ctx.config.function.agent_thought_mode == AgentThoughtMode::Chat;

        let mut by_name: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in self.global.snapshot() {
            by_name.insert(tool.schema().name, tool);
        }
        for tool in self.session.snapshot() {
            by_name.insert(tool.schema().name, tool);
        }

        let mut active: Vec<Arc<dyn Tool>> = by_name
            .into_values()
            .filter(|t| t.enabled(ctx))
            .filter(|t| !(hide_reasoning && t.is_reasoning()))
            .collect();
        active.sort_by_key(|t| t.schema().name);
        active
    }
}

/// The process-wide default global tool layer.
pub fn global_tools() -> &'static Arc<ToolsManager> {
    static GLOBAL: OnceLock<Arc<ToolsManager>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(ToolsManager::new()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
