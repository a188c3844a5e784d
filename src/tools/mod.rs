//! MCP tool definitions and registry.

pub mod admin;
pub mod maintenance;
pub mod query;
pub mod registry;
pub mod schema;

pub use admin::{
    DiagnosePoolTool, ListConnectionsTool, PoolStatusTool, RecreatePoolTool, ReleaseSessionTool,
    TestConnectionTool,
};
pub use maintenance::{CacheStatsTool, CallStatsTool, ClearCacheTool};
pub use query::ExecQueryTool;
pub use registry::{ToolHandler, ToolRegistry, failure, success};
pub use schema::{GetDbTableListTool, GetTableSchemaTool, MetadataService};

use crate::cache::MetadataCache;
use crate::database::ConnectionManager;
use crate::security::QueryGuard;
use crate::stats::CallStats;
use std::sync::Arc;

/// Create and register all tools.
pub fn create_registry(
    manager: ConnectionManager,
    cache: Arc<MetadataCache>,
    stats: Arc<CallStats>,
    guard: Option<Arc<dyn QueryGuard>>,
) -> ToolRegistry {
    let registry = ToolRegistry::new();
    let metadata = Arc::new(MetadataService::new(manager.clone(), Arc::clone(&cache)));

    // Query and metadata
    registry.register(ExecQueryTool::new(manager.clone(), guard));
    registry.register(GetTableSchemaTool::new(Arc::clone(&metadata)));
    registry.register(GetDbTableListTool::new(metadata));

    // Pool administration
    registry.register(TestConnectionTool::new(manager.clone()));
    registry.register(RecreatePoolTool::new(manager.clone()));
    registry.register(ReleaseSessionTool::new(manager.clone()));
    registry.register(PoolStatusTool::new(manager.clone()));
    registry.register(DiagnosePoolTool::new(manager.clone()));
    registry.register(ListConnectionsTool::new(manager));

    // Cache and statistics
    registry.register(CacheStatsTool::new(Arc::clone(&cache)));
    registry.register(ClearCacheTool::new(cache));
    registry.register(CallStatsTool::new(stats));

    registry
}
