//! Gateway binary: MCP over stdio in front of a Doris cluster.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use doris_mcp_gateway::{
    config::{DatabaseConfig, PoolTuning, ServerConfig},
    database::ConnectionManager,
    protocol::{McpServer, StdioTransport},
    server::{McpHandler, ServerState},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StartupMode {
    /// Refuse to start unless the pool comes up.
    Strict,
    /// Start without a backend and build the pool on first use.
    BestEffort,
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, value_enum, env = "DORIS_MCP_MODE", default_value_t = StartupMode::BestEffort)]
    mode: StartupMode,

    /// Where call statistics are persisted.
    #[arg(long, env = "DORIS_MCP_STATS_FILE")]
    stats_file: Option<PathBuf>,

    /// Tracing filter; falls back to RUST_LOG.
    #[arg(long, env = "DORIS_MCP_LOG_FILTER")]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref());

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let builder = DatabaseConfig::builder()
        .from_env()
        .context("Failed to read DORIS_* configuration")?;
    let database = match args.mode {
        StartupMode::Strict => builder.build().context("Invalid database configuration")?,
        StartupMode::BestEffort => builder.build_unchecked(),
    };
    let tuning = PoolTuning::default()
        .from_env()
        .context("Failed to read DORIS_POOL_* configuration")?;

    let mut config = ServerConfig::builder().database(database).tuning(tuning);
    if let Some(path) = args.stats_file {
        config = config.stats_path(path);
    }
    let config = config.build();

    info!(endpoint = %config.database.endpoint(), mode = ?args.mode, "Connecting to Doris");
    let manager = ConnectionManager::mysql(&config);
    match args.mode {
        StartupMode::Strict => manager
            .initialize_strict()
            .await
            .context("Database initialization failed")?,
        StartupMode::BestEffort => {
            if !manager.initialize_best_effort().await {
                warn!("Serving without a database; tools will retry on demand");
            }
        }
    }

    let state = Arc::new(ServerState::builder().config(config).manager(manager).build()?);
    info!("Server state initialized with {} tools", state.tools.len());

    let handler = Arc::new(McpHandler::new(Arc::clone(&state)));
    let server = McpServer::new(state.config.name.to_string(), handler);
    let served = server.serve(&StdioTransport::stdio()).await;

    state.manager.close().await;
    state.stats.close();
    info!("Server shutdown complete");
    served.map_err(Into::into)
}

fn init_tracing(filter: Option<&str>) {
    let filter = filter
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("doris_mcp_gateway=info,warn"));

    // stdout carries the protocol, so logs go to stderr.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .init();
}
