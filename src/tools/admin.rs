//! Pool administration tools over the connection manager.

use crate::database::ConnectionManager;
use crate::error::Result;
use crate::protocol::Tool;
use crate::tools::registry::{ToolHandler, failure, parse_args, success};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

pub struct TestConnectionTool {
    manager: ConnectionManager,
}

impl TestConnectionTool {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for TestConnectionTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "test_connection",
            description: "Probe the connection pool with SELECT 1. Never triggers recovery.",
            schema: { "type": "object", "properties": {} }
        }
    }

    async fn execute(&self, _arguments: Value) -> Result<Value> {
        if self.manager.test_connection().await {
            Ok(success(&json!({ "connected": true }), "Database connection is healthy"))
        } else {
            Ok(failure(
                "Health probe failed",
                "Database connection is not available",
            ))
        }
    }
}

pub struct RecreatePoolTool {
    manager: ConnectionManager,
}

impl RecreatePoolTool {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for RecreatePoolTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "recreate_pool",
            description: "Tear the connection pool down and rebuild it. \
                Joins a recovery already in progress instead of starting another.",
            schema: { "type": "object", "properties": {} }
        }
    }

    #[instrument(skip(self, _arguments), fields(tool = "recreate_pool"))]
    async fn execute(&self, _arguments: Value) -> Result<Value> {
        match self.manager.recreate_pool().await {
            Ok(()) => {
                info!("Connection pool recreated on request");
                Ok(success(&self.manager.get_status(), "Connection pool recreated"))
            }
            Err(e) => Ok(failure(e.to_string(), "Failed to recreate connection pool")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReleaseSessionArgs {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub struct ReleaseSessionTool {
    manager: ConnectionManager,
}

impl ReleaseSessionTool {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for ReleaseSessionTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "release_session",
            description: "Return the connection parked for a session to the pool.",
            schema: {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string", "description": "Session key, e.g. 'system' or 'query'" }
                },
                "required": ["session_id"]
            }
        }
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        let args: ReleaseSessionArgs = parse_args(arguments)?;
        let Some(session) = args.session_id.filter(|s| !s.is_empty()) else {
            return Ok(failure("Missing session_id parameter", ""));
        };

        let released = self.manager.release_session(&session).await;
        let message = if released {
            "Session connection returned to the pool"
        } else {
            "No connection was parked for this session"
        };
        Ok(success(
            &json!({ "session_id": session, "released": released }),
            message,
        ))
    }
}

pub struct PoolStatusTool {
    manager: ConnectionManager,
}

impl PoolStatusTool {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for PoolStatusTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "pool_status",
            description: "Pool state, sizes, counters and a lightweight health report.",
            schema: { "type": "object", "properties": {} }
        }
    }

    async fn execute(&self, _arguments: Value) -> Result<Value> {
        let status = json!({
            "status": self.manager.get_status(),
            "health": self.manager.health_report(),
        });
        Ok(success(&status, ""))
    }
}

pub struct DiagnosePoolTool {
    manager: ConnectionManager,
}

impl DiagnosePoolTool {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for DiagnosePoolTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "diagnose_pool",
            description: "Run a fresh health probe and report pool health, error analysis \
                and recommendations.",
            schema: { "type": "object", "properties": {} }
        }
    }

    async fn execute(&self, _arguments: Value) -> Result<Value> {
        Ok(success(&self.manager.diagnose().await, ""))
    }
}

pub struct ListConnectionsTool {
    manager: ConnectionManager,
}

impl ListConnectionsTool {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for ListConnectionsTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "list_connections",
            description: "Registered connections with their status and activity, \
                plus the session bound to each.",
            schema: { "type": "object", "properties": {} }
        }
    }

    async fn execute(&self, _arguments: Value) -> Result<Value> {
        let connections = json!({
            "connections": self.manager.get_all_connections(),
            "sessions": self.manager.get_sessions(),
        });
        Ok(success(&connections, ""))
    }
}
