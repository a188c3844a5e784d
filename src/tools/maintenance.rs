//! Metadata cache and call statistics tools.

use crate::cache::{CacheKind, MetadataCache};
use crate::error::Result;
use crate::protocol::Tool;
use crate::stats::CallStats;
use crate::tools::registry::{ToolHandler, failure, parse_args, success};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub struct CacheStatsTool {
    cache: Arc<MetadataCache>,
}

impl CacheStatsTool {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ToolHandler for CacheStatsTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "cache_stats",
            description: "Metadata cache entry counts, ages and expiry.",
            schema: { "type": "object", "properties": {} }
        }
    }

    async fn execute(&self, _arguments: Value) -> Result<Value> {
        Ok(success(&self.cache.stats(), ""))
    }
}

#[derive(Debug, Deserialize)]
pub struct ClearCacheArgs {
    #[serde(default)]
    pub cache_type: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
}

pub struct ClearCacheTool {
    cache: Arc<MetadataCache>,
}

impl ClearCacheTool {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ToolHandler for ClearCacheTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "clear_cache",
            description: "Drop cached metadata. With db_name (and optionally table_name) only \
                that database or table is invalidated; otherwise cache_type selects \
                'all', 'table_schema' or 'database_tables'.",
            schema: {
                "type": "object",
                "properties": {
                    "cache_type": { "type": "string", "enum": ["all", "table_schema", "database_tables"] },
                    "db_name": { "type": "string" },
                    "table_name": { "type": "string" }
                }
            }
        }
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        let args: ClearCacheArgs = parse_args(arguments)?;

        if let Some(db) = args.db_name.as_deref().filter(|db| !db.is_empty()) {
            return Ok(match args.table_name.as_deref().filter(|t| !t.is_empty()) {
                Some(table) => {
                    let removed = self.cache.invalidate_table(db, table);
                    success(
                        &json!({ "db_name": db, "table_name": table, "removed": removed }),
                        "Table metadata invalidated",
                    )
                }
                None => success(
                    &self.cache.invalidate_database(db),
                    "Database metadata invalidated",
                ),
            });
        }

        let kind = match args.cache_type.as_deref().unwrap_or("all") {
            "all" => None,
            other => match other.parse::<CacheKind>() {
                Ok(kind) => Some(kind),
                Err(e) => return Ok(failure(e, "")),
            },
        };
        let cleared = self.cache.clear(kind);
        Ok(success(
            &json!({ "cleared_count": cleared.len(), "cleared_keys": cleared }),
            "Metadata cache cleared",
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct CallStatsArgs {
    /// `YYYY-MM-DD`.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

pub struct CallStatsTool {
    stats: Arc<CallStats>,
}

impl CallStatsTool {
    pub fn new(stats: Arc<CallStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl ToolHandler for CallStatsTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "call_stats",
            description: "Per-day call counts of protocol methods and tools. \
                Filter by date (YYYY-MM-DD) or by method name.",
            schema: {
                "type": "object",
                "properties": {
                    "date": { "type": "string", "description": "Day to report, YYYY-MM-DD" },
                    "method": { "type": "string", "description": "Method or tool name" }
                }
            }
        }
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        let args: CallStatsArgs = parse_args(arguments)?;
        let report = match (args.date, args.method) {
            (Some(date), _) => json!({
                "date": date,
                "total": self.stats.daily_total(&date),
                "methods": self.stats.daily(&date),
            }),
            (None, Some(method)) => json!({
                "method": method,
                "total": self.stats.method_total(&method),
            }),
            (None, None) => json!({ "days": self.stats.all() }),
        };
        Ok(success(&report, ""))
    }
}
