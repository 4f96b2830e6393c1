// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Interface-level MCP integration.
//!
//! The wire protocol lives outside this crate; the runtime only needs a way
//! to connect a client per configured server script, enumerate its tools and
//! route invocations.  Hosts register a connector implementation; sessions
//! materialize clients through it on `init`.

use std::sync::{Arc, OnceLock, RwLock};

use amrita_tools::{FunctionDefinitionSchema, Tool, ToolReturn};
use async_trait::async_trait;
use serde_json::Value;

/// One connected MCP server.
#[async_trait]
pub trait McpClient: Send + Sync {
    fn name(&self) -> &str;

    /// Enumerate the tools the server exposes.
    async fn list_tools(&self) -> anyhow::Result<Vec<FunctionDefinitionSchema>>;

    /// Invoke a server tool with parsed arguments.
    async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<String>;

    /// Tear the connection down.  Called on session drop; must be safe to
    /// call more than once.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Factory turning a configured server script into a connected client.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, script: &str) -> anyhow::Result<Arc<dyn McpClient>>;
}

fn connector_slot() -> &'static RwLock<Option<Arc<dyn McpConnector>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<dyn McpConnector>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide MCP connector.
pub fn set_mcp_connector(connector: Arc<dyn McpConnector>) {
    *connector_slot().write().expect("mcp lock poisoned") = Some(connector);
}

/// The installed connector, if any.
pub fn mcp_connector() -> Option<Arc<dyn McpConnector>> {
    connector_slot().read().expect("mcp lock poisoned").clone()
}

/// Adapter exposing one MCP server tool through the [`Tool`] trait, so
/// imported tools dispatch exactly like local ones.
pub struct McpToolProxy {
    client: Arc<dyn McpClient>,
    schema: FunctionDefinitionSchema,
}

impl McpToolProxy {
    pub fn new(client: Arc<dyn McpClient>, schema: FunctionDefinitionSchema) -> Self {
        Self { client, schema }
    }
}

#[async_trait]
impl Tool for McpToolProxy {
    fn schema(&self) -> FunctionDefinitionSchema {
        self.schema.clone()
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReturn> {
        let out = self.client.call_tool(&self.schema.name, args).await?;
        Ok(ToolReturn::Text(out))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) struct FakeMcpClient {
        pub tools: Vec<FunctionDefinitionSchema>,
    }

    #[async_trait]
    impl McpClient for FakeMcpClient {
        fn name(&self) -> &str {
            "fake"
        }
        async fn list_tools(&self) -> anyhow::Result<Vec<FunctionDefinitionSchema>> {
            Ok(self.tools.clone())
        }
        async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<String> {
            Ok(format!("{name}:{args}"))
        }
        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn proxy_routes_invocations_to_the_client() {
        let schema = FunctionDefinitionSchema::new("remote_echo", "echo on the server");
        let client = Arc::new(FakeMcpClient {
            tools: vec![schema.clone()],
        });
        let proxy = McpToolProxy::new(client, schema);
        let out = proxy.invoke(serde_json::json!({ "x": 1 })).await.unwrap();
        assert_eq!(out, ToolReturn::Text("remote_echo:{\"x\":1}".into()));
    }

    #[test]
    fn proxy_reports_the_server_schema() {
        let schema = FunctionDefinitionSchema::new("remote_echo", "echo on the server");
        let client = Arc::new(FakeMcpClient { tools: vec![] });
        let proxy = McpToolProxy::new(client, schema.clone());
        assert_eq!(proxy.schema(), schema);
    }
}
