//! MCP handler over [`ServerState`].

use crate::error::ProtocolResult;
use crate::protocol::{
    CallToolParams, CallToolResult, Handler, InitializeParams, InitializeResult, ListToolsResult,
    MCP_VERSION, PeerInfo, ServerCapabilities, ToolsCapability,
};
use crate::server::state::ServerState;
use crate::tools::registry::timestamp;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

const INSTRUCTIONS: &str = "Apache Doris gateway. Query tools: exec_query, get_table_schema, \
    get_db_table_list. Pool administration: test_connection, pool_status, diagnose_pool, \
    list_connections, recreate_pool, release_session. Housekeeping: cache_stats, clear_cache, \
    call_stats. Every tool answers with {success, result|error, message, timestamp}.";

pub struct McpHandler {
    state: Arc<ServerState>,
}

impl McpHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }
}

#[async_trait]
impl Handler for McpHandler {
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult> {
        match &params.client_info {
            Some(client) => info!("Initialize request from {} v{}", client.name, client.version),
            None => info!("Initialize request from an unnamed client"),
        }
        self.state.set_initialized(params.client_info);

        Ok(InitializeResult {
            protocol_version: MCP_VERSION.into(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: PeerInfo {
                name: self.state.config.name.to_string(),
                version: self.state.config.version.to_string(),
            },
            instructions: Some(INSTRUCTIONS.into()),
        })
    }

    async fn initialized(&self) -> ProtocolResult<()> {
        info!("Client initialized");
        Ok(())
    }

    async fn shutdown(&self) -> ProtocolResult<()> {
        info!("Shutting down: closing connection pool and saving call stats");
        self.state.manager.close().await;
        self.state.stats.close();
        Ok(())
    }

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
        self.state.next_request();
        self.state.stats.record("tools/list");
        let tools = self.state.tools.list();
        debug!("Listing {} tools", tools.len());
        Ok(ListToolsResult { tools })
    }

    #[instrument(skip(self, params), fields(tool = %params.name))]
    async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult> {
        self.state.next_request();
        self.state.stats.record(&params.name);

        let tool_name = params.name.clone();
        let arguments = params.arguments.clone();
        let started = Instant::now();

        match self.state.tools.execute(params).await {
            Ok(mut envelope) => {
                let elapsed = started.elapsed().as_secs_f64();
                debug!(elapsed, "Tool call finished");
                if let Value::Object(map) = &mut envelope {
                    map.insert(
                        "_execution_info".into(),
                        json!({
                            "tool_name": tool_name,
                            "execution_time": (elapsed * 1000.0).round() / 1000.0,
                            "timestamp": timestamp(),
                        }),
                    );
                }
                Ok(CallToolResult::envelope(&envelope, false))
            }
            Err(e) => {
                error!("Tool dispatch failed: {}", e);
                let envelope = json!({
                    "error": e.to_string(),
                    "tool_name": tool_name,
                    "arguments": arguments,
                    "timestamp": timestamp(),
                });
                Ok(CallToolResult::envelope(&envelope, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolTuning, ServerConfig, SessionCacheConfig};
    use crate::database::{ConnectionManager, PoolState};
    use crate::database::testing::ScriptedBackend;
    use crate::stats::CallStats;

    async fn handler(backend: &ScriptedBackend) -> McpHandler {
        let config = ServerConfig::default();
        let manager = ConnectionManager::new(
            config.database.clone(),
            PoolTuning::default(),
            SessionCacheConfig::default(),
            Arc::new(backend.clone()),
        );
        manager.initialize_strict().await.unwrap();
        let state = ServerState::builder()
            .config(config)
            .manager(manager)
            .stats(Arc::new(CallStats::in_memory()))
            .build()
            .unwrap();
        McpHandler::new(Arc::new(state))
    }

    fn call(name: &str, arguments: Value) -> CallToolParams {
        CallToolParams {
            name: name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_successful_call_carries_execution_info() {
        let backend = ScriptedBackend::new();
        let handler = handler(&backend).await;

        let result = handler
            .call_tool(call("exec_query", json!({ "sql": "SELECT 1" })))
            .await
            .unwrap();
        assert!(result.is_error.is_none());
        let envelope = result.envelope_value().unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(envelope["_execution_info"]["tool_name"], "exec_query");
        assert!(envelope["_execution_info"]["execution_time"].is_number());
    }

    #[tokio::test]
    async fn test_tool_failure_stays_in_envelope() {
        let backend = ScriptedBackend::new();
        let handler = handler(&backend).await;

        let result = handler
            .call_tool(call("get_table_schema", json!({ "table_name": "x; DROP" })))
            .await
            .unwrap();
        assert!(result.is_error.is_none());
        let envelope = result.envelope_value().unwrap();
        assert_eq!(envelope["success"], false);
        assert!(envelope.get("_execution_info").is_some());
    }

    #[tokio::test]
    async fn test_dispatch_failure_envelope() {
        let backend = ScriptedBackend::new();
        let handler = handler(&backend).await;

        let result = handler
            .call_tool(call("no_such_tool", json!({ "a": 1 })))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        let envelope = result.envelope_value().unwrap();
        assert_eq!(envelope["tool_name"], "no_such_tool");
        assert_eq!(envelope["arguments"], json!({ "a": 1 }));
        assert!(envelope["error"].as_str().unwrap().contains("no_such_tool"));

        let result = handler
            .call_tool(call("exec_query", json!({ "max_rows": "many" })))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn test_calls_are_counted_and_shutdown_closes_pool() {
        let backend = ScriptedBackend::new();
        let handler = handler(&backend).await;

        handler.list_tools().await.unwrap();
        handler
            .call_tool(call("test_connection", Value::Null))
            .await
            .unwrap();
        handler
            .call_tool(call("test_connection", Value::Null))
            .await
            .unwrap();

        let stats = &handler.state().stats;
        assert_eq!(stats.method_total("tools/list"), 1);
        assert_eq!(stats.method_total("test_connection"), 2);
        assert_eq!(handler.state().request_count(), 3);

        handler.shutdown().await.unwrap();
        assert_eq!(handler.state().manager.state(), PoolState::Closed);
        // Idempotent.
        handler.shutdown().await.unwrap();
    }
}
