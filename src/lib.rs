//! MCP gateway for Apache Doris.
//!
//! Serves query and metadata tools over the Model Context Protocol, backed by
//! a connection pool that monitors its own health and rebuilds itself when
//! the backend goes away.
//!
//! # Example
//!
//! ```no_run
//! use doris_mcp_gateway::{
//!     config::{DatabaseConfig, ServerConfig},
//!     database::ConnectionManager,
//!     protocol::{McpServer, StdioTransport},
//!     server::{McpHandler, ServerState},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let database = DatabaseConfig::builder().from_env()?.build()?;
//!     let config = ServerConfig::builder().database(database).build();
//!
//!     let manager = ConnectionManager::mysql(&config);
//!     manager.initialize_strict().await?;
//!     let state = Arc::new(ServerState::builder().config(config).manager(manager).build()?);
//!
//!     let server = McpServer::new("doris-mcp-gateway", Arc::new(McpHandler::new(Arc::clone(&state))));
//!     server.serve(&StdioTransport::stdio()).await?;
//!     state.manager.close().await;
//!     state.stats.close();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod protocol;
pub mod security;
pub mod server;
pub mod stats;
pub mod tools;

pub use cache::MetadataCache;
pub use config::{DatabaseConfig, DatabaseConfigBuilder, PoolTuning, ServerConfig};
pub use database::{ConnectionManager, PoolState, QueryResult};
pub use error::{McpError, Result};
pub use protocol::McpServer;
pub use security::{QueryGuard, SqlValidator, validate_identifier};
pub use server::{McpHandler, ServerState, ServerStateBuilder};
pub use stats::CallStats;
