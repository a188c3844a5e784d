//! Metadata tools: get_table_schema, get_db_table_list.

use crate::cache::MetadataCache;
use crate::database::{ColumnSchema, ConnectionManager, TableInfo};
use crate::error::{DbResult, Result};
use crate::protocol::Tool;
use crate::security::validate_identifier;
use crate::tools::registry::{ToolHandler, failure, parse_args, success};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Session key the metadata queries run under.
const METADATA_SESSION: &str = "system";

/// Points `information_schema` at another catalog with three-part naming.
pub fn with_catalog<'a>(sql: &'a str, catalog: Option<&str>) -> Cow<'a, str> {
    match catalog {
        Some(catalog) if sql.to_lowercase().contains("information_schema") => Cow::Owned(
            sql.replace("information_schema", &format!("{}.information_schema", catalog)),
        ),
        _ => Cow::Borrowed(sql),
    }
}

fn columns_sql(db: &str, table: &str) -> String {
    format!(
        "SELECT COLUMN_NAME AS `Field`, COLUMN_TYPE AS `Type`, \
         CASE WHEN COLUMN_KEY = 'PRI' THEN 'YES' ELSE '' END AS `Key`, \
         IS_NULLABLE AS `Null`, COLUMN_DEFAULT AS `Default`, EXTRA, \
         COLUMN_COMMENT AS `Comment` \
         FROM information_schema.columns \
         WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' \
         ORDER BY ORDINAL_POSITION",
        db, table
    )
}

fn tables_sql(db: &str) -> String {
    format!(
        "SELECT TABLE_NAME AS `TABLE_NAME`, TABLE_COMMENT AS `TABLE_COMMENT` \
         FROM information_schema.tables \
         WHERE TABLE_SCHEMA = '{}' AND TABLE_TYPE = 'BASE TABLE'",
        db
    )
}

/// Cached reads of `information_schema`.
///
/// Callers validate identifiers first; this type only interpolates.
pub struct MetadataService {
    manager: ConnectionManager,
    cache: Arc<MetadataCache>,
    default_db: String,
}

impl MetadataService {
    pub fn new(manager: ConnectionManager, cache: Arc<MetadataCache>) -> Self {
        let default_db = manager.config().database.clone();
        Self {
            manager,
            cache,
            default_db,
        }
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// `db` when given and non-empty, the configured database otherwise.
    pub fn effective_db<'a>(&'a self, db: Option<&'a str>) -> &'a str {
        db.filter(|db| !db.is_empty()).unwrap_or(&self.default_db)
    }

    pub async fn table_columns(
        &self,
        db: &str,
        table: &str,
        catalog: Option<&str>,
    ) -> DbResult<Vec<ColumnSchema>> {
        if let Some(columns) = self.cache.get_columns(db, table) {
            return Ok(columns);
        }

        debug!(db, table, "Metadata cache miss, querying table schema");
        let sql = columns_sql(db, table);
        let result = self
            .manager
            .execute_query(METADATA_SESSION, &with_catalog(&sql, catalog), &[])
            .await?;
        let columns: Vec<ColumnSchema> = result.data.iter().map(ColumnSchema::from_row).collect();

        if !columns.is_empty() {
            self.cache.set_columns(db, table, columns.clone());
        }
        Ok(columns)
    }

    pub async fn table_list(&self, db: &str, catalog: Option<&str>) -> DbResult<Vec<TableInfo>> {
        if let Some(tables) = self.cache.get_tables(db) {
            return Ok(tables);
        }

        debug!(db, "Metadata cache miss, querying table list");
        let sql = tables_sql(db);
        let result = self
            .manager
            .execute_query(METADATA_SESSION, &with_catalog(&sql, catalog), &[])
            .await?;
        let tables: Vec<TableInfo> = result.data.iter().map(TableInfo::from_row).collect();

        self.cache.set_tables(db, tables.clone());
        Ok(tables)
    }
}

/// Validates an optional identifier argument, producing the failure
/// envelope the tools return on rejection.
fn check_optional(value: Option<&str>, kind: &'static str, label: &str) -> Option<Value> {
    let value = value.filter(|v| !v.is_empty())?;
    validate_identifier(value, kind).err().map(|_| {
        failure(
            format!("Invalid {}: {}", kind, value),
            &format!("{} contains invalid characters", label),
        )
    })
}

#[derive(Debug, Deserialize)]
pub struct GetTableSchemaArgs {
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub catalog_name: Option<String>,
}

pub struct GetTableSchemaTool {
    metadata: Arc<MetadataService>,
}

impl GetTableSchemaTool {
    pub fn new(metadata: Arc<MetadataService>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl ToolHandler for GetTableSchemaTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "get_table_schema",
            description: "Get detailed schema information for a table: column names, types, \
                nullability, defaults, key flags and comments.",
            schema: {
                "type": "object",
                "properties": {
                    "table_name": { "type": "string", "description": "Table name" },
                    "db_name": { "type": "string", "description": "Database name (defaults to the configured database)" },
                    "catalog_name": { "type": "string", "description": "Catalog for federated metadata (defaults to the internal catalog)" }
                },
                "required": ["table_name"]
            }
        }
    }

    #[instrument(skip(self, arguments), fields(tool = "get_table_schema"))]
    async fn execute(&self, arguments: Value) -> Result<Value> {
        let args: GetTableSchemaArgs = parse_args(arguments)?;
        let Some(table) = args.table_name.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(failure("Missing table_name parameter", ""));
        };
        if validate_identifier(table, "table name").is_err() {
            return Ok(failure(
                format!("Invalid table name: {}", table),
                "Table name contains invalid characters",
            ));
        }
        if let Some(rejected) = check_optional(args.db_name.as_deref(), "database name", "Database name")
            .or_else(|| check_optional(args.catalog_name.as_deref(), "catalog name", "Catalog name"))
        {
            return Ok(rejected);
        }

        let db = self.metadata.effective_db(args.db_name.as_deref());
        info!(db, table, "Getting table schema");

        match self
            .metadata
            .table_columns(db, table, args.catalog_name.as_deref())
            .await
        {
            Ok(columns) if columns.is_empty() => Ok(failure(
                "Table does not exist or has no columns",
                &format!("Unable to get schema for {}.{}", db, table),
            )),
            Ok(columns) => Ok(success(&columns, "")),
            Err(e) => Ok(failure(
                e.to_string(),
                "Error occurred while getting table schema",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GetDbTableListArgs {
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub catalog_name: Option<String>,
}

pub struct GetDbTableListTool {
    metadata: Arc<MetadataService>,
}

impl GetDbTableListTool {
    pub fn new(metadata: Arc<MetadataService>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl ToolHandler for GetDbTableListTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "get_db_table_list",
            description: "List the base tables of a database with their comments.",
            schema: {
                "type": "object",
                "properties": {
                    "db_name": { "type": "string", "description": "Database name (defaults to the configured database)" },
                    "catalog_name": { "type": "string", "description": "Catalog for federated metadata" }
                }
            }
        }
    }

    #[instrument(skip(self, arguments), fields(tool = "get_db_table_list"))]
    async fn execute(&self, arguments: Value) -> Result<Value> {
        let args: GetDbTableListArgs = parse_args(arguments)?;
        if let Some(rejected) = check_optional(args.db_name.as_deref(), "database name", "Database name")
            .or_else(|| check_optional(args.catalog_name.as_deref(), "catalog name", "Catalog name"))
        {
            return Ok(rejected);
        }

        let db = self.metadata.effective_db(args.db_name.as_deref());
        info!(db, "Getting database table list");

        match self
            .metadata
            .table_list(db, args.catalog_name.as_deref())
            .await
        {
            Ok(tables) => Ok(success(&tables, "")),
            Err(e) => Ok(failure(
                e.to_string(),
                "Error occurred while getting database table list",
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
    use serde_json::json;

    async fn service(backend: &ScriptedBackend) -> Arc<MetadataService> {
        let config = DatabaseConfig::builder().database("sales").build().unwrap();
        let manager = ConnectionManager::new(
            config,
            PoolTuning::default(),
            SessionCacheConfig::default(),
            Arc::new(backend.clone()),
        );
        manager.initialize_strict().await.unwrap();
        Arc::new(MetadataService::new(
            manager,
            Arc::new(MetadataCache::default()),
        ))
    }

    fn metadata_queries(backend: &ScriptedBackend) -> Vec<String> {
        backend
            .executed()
            .into_iter()
            .filter(|sql| sql.contains("information_schema"))
            .collect()
    }

    #[test]
    fn test_catalog_rewrite() {
        let sql = "SELECT * FROM information_schema.tables";
        assert_eq!(with_catalog(sql, None), sql);
        assert_eq!(
            with_catalog(sql, Some("hive")),
            "SELECT * FROM hive.information_schema.tables"
        );
        assert_eq!(with_catalog("SELECT 1", Some("hive")), "SELECT 1");
    }

    #[tokio::test]
    async fn test_injected_table_name_never_reaches_backend() {
        let backend = ScriptedBackend::new();
        let tool = GetTableSchemaTool::new(service(&backend).await);

        let envelope = tool
            .execute(json!({ "table_name": "users; DROP TABLE x" }))
            .await
            .unwrap();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"], "Invalid table name: users; DROP TABLE x");
        assert_eq!(envelope["message"], "Table name contains invalid characters");
        assert!(metadata_queries(&backend).is_empty());
    }

    #[tokio::test]
    async fn test_schema_is_fetched_once_then_cached() {
        let backend = ScriptedBackend::new();
        backend.respond(
            "information_schema.columns",
            &["Field", "Type", "Key", "Null", "Default", "EXTRA", "Comment"],
            vec![vec![
                CellValue::from("order_id"),
                CellValue::from("bigint"),
                CellValue::from("YES"),
                CellValue::from("NO"),
                CellValue::Null,
                CellValue::from(""),
                CellValue::from("id"),
            ]],
        );
        let tool = GetTableSchemaTool::new(service(&backend).await);

        let first = tool.execute(json!({ "table_name": "orders" })).await.unwrap();
        let second = tool.execute(json!({ "table_name": "orders" })).await.unwrap();
        assert_eq!(first["success"], true);
        assert_eq!(first["result"][0]["column_name"], "order_id");
        assert_eq!(second["result"], first["result"]);

        let queries = metadata_queries(&backend);
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains("TABLE_SCHEMA = 'sales'"));
        assert!(queries[0].contains("TABLE_NAME = 'orders'"));
    }

    #[tokio::test]
    async fn test_missing_table_reports_failure() {
        let backend = ScriptedBackend::new();
        let tool = GetTableSchemaTool::new(service(&backend).await);

        let envelope = tool
            .execute(json!({ "table_name": "ghost", "db_name": "hr" }))
            .await
            .unwrap();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["message"], "Unable to get schema for hr.ghost");

        let envelope = tool.execute(json!({})).await.unwrap();
        assert_eq!(envelope["error"], "Missing table_name parameter");
    }

    #[tokio::test]
    async fn test_table_list_with_catalog() {
        let backend = ScriptedBackend::new();
        backend.respond(
            "information_schema.tables",
            &["TABLE_NAME", "TABLE_COMMENT"],
            vec![vec![CellValue::from("orders"), CellValue::from("fact table")]],
        );
        let tool = GetDbTableListTool::new(service(&backend).await);

        let envelope = tool
            .execute(json!({ "db_name": "ods", "catalog_name": "hive" }))
            .await
            .unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(envelope["result"][0]["table_name"], "orders");
        assert_eq!(envelope["result"][0]["table_comment"], "fact table");

        let queries = metadata_queries(&backend);
        assert!(queries[0].contains("FROM hive.information_schema.tables"));

        let rejected = tool.execute(json!({ "db_name": "ods'--" })).await.unwrap();
        assert_eq!(rejected["error"], "Invalid database name: ods'--");
        assert_eq!(metadata_queries(&backend).len(), 1);
    }
}
