//! `exec_query`: runs caller SQL through the connection manager.

use crate::database::ConnectionManager;
use crate::error::Result;
use crate::protocol::Tool;
use crate::security::{QueryGuard, validate_identifier};
use crate::tools::registry::{ToolHandler, failure, parse_args, success};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const QUERY_SESSION: &str = "query";

#[derive(Debug, Deserialize)]
pub struct ExecQueryArgs {
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub catalog_name: Option<String>,
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

pub struct ExecQueryTool {
    manager: ConnectionManager,
    guard: Option<Arc<dyn QueryGuard>>,
    default_max_rows: usize,
    default_timeout: Duration,
}

impl ExecQueryTool {
    pub fn new(manager: ConnectionManager, guard: Option<Arc<dyn QueryGuard>>) -> Self {
        Self {
            manager,
            guard,
            default_max_rows: 100,
            default_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_default_max_rows(mut self, max_rows: usize) -> Self {
        self.default_max_rows = max_rows;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[async_trait]
impl ToolHandler for ExecQueryTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "exec_query",
            description: "Execute a SQL statement against Doris and return the result rows. \
                Results are capped at max_rows; a capped result carries truncated: true.",
            schema: {
                "type": "object",
                "properties": {
                    "sql": { "type": "string", "description": "SQL statement to execute" },
                    "db_name": { "type": "string", "description": "Database the statement targets (validated, not switched to)" },
                    "catalog_name": { "type": "string", "description": "Catalog the statement targets" },
                    "max_rows": { "type": "integer", "description": "Maximum rows returned (default 100)", "minimum": 1 },
                    "timeout": { "type": "integer", "description": "Timeout in seconds (default 30)", "minimum": 1 }
                },
                "required": ["sql"]
            }
        }
    }

    #[instrument(skip(self, arguments), fields(tool = "exec_query"))]
    async fn execute(&self, arguments: Value) -> Result<Value> {
        let args: ExecQueryArgs = parse_args(arguments)?;
        let Some(sql) = args.sql.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(failure(
                "No SQL statement provided",
                "Please provide SQL statement to execute",
            ));
        };

        if let Some(catalog) = args.catalog_name.as_deref().filter(|c| !c.is_empty())
            && validate_identifier(catalog, "catalog name").is_err()
        {
            return Ok(failure(
                format!("Invalid catalog name: {}", catalog),
                "Catalog name contains invalid characters",
            ));
        }
        if let Some(db) = args.db_name.as_deref().filter(|d| !d.is_empty())
            && validate_identifier(db, "database name").is_err()
        {
            return Ok(failure(
                format!("Invalid database name: {}", db),
                "Database name contains invalid characters",
            ));
        }

        if let Some(guard) = &self.guard
            && let Err(e) = guard.check(sql)
        {
            warn!("Statement rejected: {}", e);
            return Ok(failure(e.to_string(), "SQL statement rejected by security policy"));
        }

        let max_rows = args.max_rows.unwrap_or(self.default_max_rows);
        let limit = args
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        debug!(max_rows, timeout_secs = limit.as_secs(), "Executing query");

        match self
            .manager
            .execute_query_with_timeout(QUERY_SESSION, sql, &[], limit)
            .await
        {
            Ok(result) => Ok(success(&result.truncate(max_rows), "")),
            Err(e) => Ok(failure(
                e.to_string(),
                "Error occurred while executing SQL query",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, PoolTuning, SessionCacheConfig};
    use crate::database::CellValue;
    use crate::database::testing::ScriptedBackend;
    use crate::security::SqlValidator;
    use serde_json::json;

    async fn tool(backend: &ScriptedBackend, guard: Option<Arc<dyn QueryGuard>>) -> ExecQueryTool {
        let manager = ConnectionManager::new(
            DatabaseConfig::default(),
            PoolTuning::default(),
            SessionCacheConfig::default(),
            Arc::new(backend.clone()),
        );
        manager.initialize_strict().await.unwrap();
        ExecQueryTool::new(manager, guard)
    }

    fn user_statements(backend: &ScriptedBackend) -> Vec<String> {
        backend
            .executed()
            .into_iter()
            .filter(|sql| !sql.eq_ignore_ascii_case("SELECT 1"))
            .collect()
    }

    #[tokio::test]
    async fn test_rows_are_capped() {
        let backend = ScriptedBackend::new();
        let rows = (0..5i64).map(|i| vec![CellValue::from(i)]).collect();
        backend.respond("FROM orders", &["id"], rows);
        let tool = tool(&backend, None).await;

        let envelope = tool
            .execute(json!({ "sql": "SELECT id FROM orders", "max_rows": 3 }))
            .await
            .unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(envelope["result"]["row_count"], 3);
        assert_eq!(envelope["result"]["truncated"], true);
        assert_eq!(envelope["result"]["data"].as_array().unwrap().len(), 3);

        let envelope = tool
            .execute(json!({ "sql": "SELECT id FROM orders" }))
            .await
            .unwrap();
        assert_eq!(envelope["result"]["row_count"], 5);
        assert!(envelope["result"].get("truncated").is_none());
    }

    #[tokio::test]
    async fn test_input_rejections() {
        let backend = ScriptedBackend::new();
        let tool = tool(&backend, None).await;

        let envelope = tool.execute(json!({})).await.unwrap();
        assert_eq!(envelope["error"], "No SQL statement provided");
        assert_eq!(envelope["message"], "Please provide SQL statement to execute");

        let envelope = tool
            .execute(json!({ "sql": "SELECT 2", "db_name": "a b" }))
            .await
            .unwrap();
        assert_eq!(envelope["error"], "Invalid database name: a b");

        let envelope = tool
            .execute(json!({ "sql": "SELECT 2", "catalog_name": "hive;" }))
            .await
            .unwrap();
        assert_eq!(envelope["error"], "Invalid catalog name: hive;");
        assert!(user_statements(&backend).is_empty());
    }

    #[tokio::test]
    async fn test_guard_blocks_writes() {
        let backend = ScriptedBackend::new();
        let guard: Arc<dyn QueryGuard> = Arc::new(SqlValidator::new());
        let tool = tool(&backend, Some(guard)).await;

        let envelope = tool
            .execute(json!({ "sql": "DELETE FROM orders" }))
            .await
            .unwrap();
        assert_eq!(envelope["success"], false);
        assert!(user_statements(&backend).is_empty());

        let envelope = tool
            .execute(json!({ "sql": "SHOW TABLES" }))
            .await
            .unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(user_statements(&backend), vec!["SHOW TABLES".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let backend = ScriptedBackend::new();
        let tool = tool(&backend, None).await;
        backend.set_query_delay(Some(Duration::from_secs(60)));

        let envelope = tool
            .execute(json!({ "sql": "SELECT * FROM big", "timeout": 2 }))
            .await
            .unwrap();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["message"], "Error occurred while executing SQL query");
    }

    #[tokio::test]
    async fn test_backend_failure_is_an_envelope() {
        let backend = ScriptedBackend::new();
        let tool = tool(&backend, None).await;
        backend.fail_queries(true);

        let envelope = tool
            .execute(json!({ "sql": "SELECT * FROM orders" }))
            .await
            .unwrap();
        assert_eq!(envelope["success"], false);
        assert!(envelope["error"].as_str().unwrap().contains("scripted query failure"));
    }
}
