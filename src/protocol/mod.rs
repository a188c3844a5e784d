//! MCP over JSON-RPC 2.0.

pub mod handler;
pub mod server;
pub mod transport;
pub mod types;

pub use handler::{Dispatcher, Handler};
pub use server::{McpServer, Phase};
pub use transport::{Inbound, LineTransport, StdioTransport, Transport};
pub use types::*;
