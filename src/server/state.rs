//! Shared state behind the MCP handler.

use crate::cache::MetadataCache;
use crate::config::ServerConfig;
use crate::database::ConnectionManager;
use crate::error::{ConfigError, Result};
use crate::protocol::PeerInfo;
use crate::security::{QueryGuard, SqlValidator};
use crate::stats::CallStats;
use crate::tools::ToolRegistry;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct ServerState {
    pub config: ServerConfig,
    pub manager: ConnectionManager,
    pub tools: ToolRegistry,
    pub stats: Arc<CallStats>,
    pub cache: Arc<MetadataCache>,
    initialized: AtomicBool,
    client_info: RwLock<Option<PeerInfo>>,
    request_count: AtomicU64,
}

impl ServerState {
    pub fn builder() -> ServerStateBuilder {
        ServerStateBuilder::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_initialized(&self, client_info: Option<PeerInfo>) {
        *self.client_info.write() = client_info;
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn client_info(&self) -> Option<PeerInfo> {
        self.client_info.read().clone()
    }

    /// Counts a request and returns its sequence number.
    pub fn next_request(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct ServerStateBuilder {
    config: Option<ServerConfig>,
    manager: Option<ConnectionManager>,
    stats: Option<Arc<CallStats>>,
    guard: Option<Option<Arc<dyn QueryGuard>>>,
}

impl ServerStateBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn manager(mut self, manager: ConnectionManager) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Defaults to statistics loaded from `config.stats_path`.
    pub fn stats(mut self, stats: Arc<CallStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Overrides the guard derived from `config.security`. `None` runs
    /// `exec_query` unguarded.
    pub fn guard(mut self, guard: Option<Arc<dyn QueryGuard>>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// # Errors
    ///
    /// [`ConfigError::MissingField`] when no connection manager was given.
    pub fn build(self) -> Result<ServerState> {
        let config = self.config.unwrap_or_default();
        let manager = self
            .manager
            .ok_or_else(|| ConfigError::MissingField("connection manager".into()))?;
        let stats = self
            .stats
            .unwrap_or_else(|| Arc::new(CallStats::load(&config.stats_path)));
        let guard = self.guard.unwrap_or_else(|| {
            config.security.read_only.then(|| {
                Arc::new(SqlValidator::new().max_query_length(config.security.max_query_length))
                    as Arc<dyn QueryGuard>
            })
        });
        let cache = Arc::new(MetadataCache::new(config.metadata_cache_ttl));

        let tools = crate::tools::create_registry(
            manager.clone(),
            Arc::clone(&cache),
            Arc::clone(&stats),
            guard,
        );

        Ok(ServerState {
            config,
            manager,
            tools,
            stats,
            cache,
            initialized: AtomicBool::new(false),
            client_info: RwLock::new(None),
            request_count: AtomicU64::new(0),
        })
    }
}
