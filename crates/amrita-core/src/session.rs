// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use amrita_config::AmritaConfig;
use amrita_model::PresetRegistry;
use amrita_tools::{global_tools, MultiToolsManager, ToolsManager};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AmritaError;
use crate::mcp::{mcp_connector, McpClient, McpToolProxy};
use crate::memory::MemoryModel;

/// Per-conversation container: memory, tools, presets, config override and
/// MCP clients.  Owned exclusively by the [`SessionRegistry`]; all outside
/// access goes through the registry's `get`.
pub struct SessionData {
    pub session_id: String,
    pub memory: MemoryModel,
    pub tools: MultiToolsManager,
    pub presets: PresetRegistry,
    /// Shadows the global config for turns in this session.
    pub config: Option<Arc<AmritaConfig>>,
    pub mcp_clients: Vec<Arc<dyn McpClient>>,
    initialized: bool,
}

impl SessionData {
    fn new(session_id: String, config: Option<AmritaConfig>, global: Arc<ToolsManager>) -> Self {
        Self {
            session_id,
            memory: MemoryModel::new(),
            tools: MultiToolsManager::new(global),
            presets: PresetRegistry::new(),
            config: config.map(Arc::new),
            mcp_clients: Vec::new(),
            initialized: false,
        }
    }
}

/// Process-wide (or test-local) owner of all sessions.
///
/// Isolation invariant: no two sessions share mutable state; every session
/// lives behind its own lock and cross-session reads go through [`get`].
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionData>>>>,
    global_tools: Arc<ToolsManager>,
}

impl SessionRegistry {
    pub fn new(global_tools: Arc<ToolsManager>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            global_tools,
        }
    }

    /// Create a session with a fresh random id and optional config override.
    pub async fn new_session(&self, config: Option<AmritaConfig>) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.create_with_id(id.clone(), config).await;
        id
    }

    /// Create a session under a caller-chosen id (auto-create path).  A
    /// no-op when the id already exists.
    pub async fn ensure(&self, session_id: &str) -> Arc<Mutex<SessionData>> {
        if let Ok(existing) = self.get(session_id).await {
            return existing;
        }
        self.create_with_id(session_id.to_string(), None).await
    }

    async fn create_with_id(
        &self,
        session_id: String,
        config: Option<AmritaConfig>,
    ) -> Arc<Mutex<SessionData>> {
        let data = Arc::new(Mutex::new(SessionData::new(
            session_id.clone(),
            config,
            Arc::clone(&self.global_tools),
        )));
        debug!(%session_id, "session created");
        self.sessions
            .write()
            .await
            .insert(session_id, Arc::clone(&data));
        data
    }

    /// Materialize the session's MCP clients and import their tools into the
    /// session layer.  Idempotent.
    pub async fn init(&self, session_id: &str) -> Result<(), AmritaError> {
        let session = self.get(session_id).await?;
        let mut data = session.lock().await;
        if data.initialized {
            return Ok(());
        }

        let cfg = self.resolve_config(&data).await?;
        if cfg.function.agent_mcp_client_enable {
            if let Some(connector) = mcp_connector() {
                for script in &cfg.function.agent_mcp_server_scripts {
                    match connector.connect(script).await {
                        Ok(client) => {
                            match client.list_tools().await {
                                Ok(schemas) => {
                                    for schema in schemas {
                                        data.tools.session_layer().register(Arc::new(
                                            McpToolProxy::new(Arc::clone(&client), schema),
                                        ));
                                    }
                                }
                                Err(e) => {
                                    warn!(%script, error = %e, "MCP tool listing failed")
                                }
                            }
                            data.mcp_clients.push(client);
                        }
                        Err(e) => warn!(%script, error = %e, "MCP connect failed"),
                    }
                }
            }
        }
        data.initialized = true;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<Mutex<SessionData>>, AmritaError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AmritaError::SessionNotFound(session_id.to_string()))
    }

    /// Tear a session down and remove it.  Idempotent.
    pub async fn drop_session(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed {
            let mut data = session.lock().await;
            for client in data.mcp_clients.drain(..) {
                if let Err(e) = client.shutdown().await {
                    warn!(error = %e, "MCP shutdown failed");
                }
            }
            debug!(%session_id, "session dropped");
        }
    }

    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The scoped config accessor: session override when present, otherwise
    /// the process-wide config.
    pub async fn config_for(
        &self,
        session_id: Option<&str>,
    ) -> Result<Arc<AmritaConfig>, AmritaError> {
        if let Some(id) = session_id {
            let session = self.get(id).await?;
            let data = session.lock().await;
            return self.resolve_config(&data).await;
        }
        Ok(amrita_config::config()?)
    }

    async fn resolve_config(&self, data: &SessionData) -> Result<Arc<AmritaConfig>, AmritaError> {
        match &data.config {
            Some(cfg) => Ok(Arc::clone(cfg)),
            None => Ok(amrita_config::config()?),
        }
    }
}

/// The process-wide default session registry, layered on the default global
/// tool set.
pub fn global_sessions() -> &'static Arc<SessionRegistry> {
    static GLOBAL: OnceLock<Arc<SessionRegistry>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(SessionRegistry::new(Arc::clone(global_tools()))))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
