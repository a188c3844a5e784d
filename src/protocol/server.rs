//! Serve loop: read a request, dispatch, answer, until EOF or `shutdown`.

use crate::error::{ProtocolError, Result};
use crate::protocol::handler::{Dispatcher, Handler};
use crate::protocol::transport::{Inbound, Transport};
use crate::protocol::types::JsonRpcResponse;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Where the session is in the MCP handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    /// `initialize` answered, waiting for the client's `initialized`.
    Initializing,
    Running,
    Stopped,
}

pub struct McpServer<H: Handler> {
    name: String,
    dispatcher: Dispatcher<H>,
    phase: RwLock<Phase>,
}

impl<H: Handler> McpServer<H> {
    pub fn new(name: impl Into<String>, handler: Arc<H>) -> Self {
        Self {
            name: name.into(),
            dispatcher: Dispatcher::new(handler),
            phase: RwLock::new(Phase::Created),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    pub fn handler(&self) -> &Arc<H> {
        self.dispatcher.handler()
    }

    /// Serves `transport` until the client closes it or asks for `shutdown`.
    ///
    /// # Errors
    ///
    /// Read failures on the transport. Write failures are logged and the
    /// loop continues with the next request.
    #[instrument(skip_all, fields(server = %self.name))]
    pub async fn serve<T: Transport>(&self, transport: &T) -> Result<()> {
        info!("MCP server listening");

        let outcome = loop {
            let request = match transport.receive().await {
                Ok(Some(Inbound::Request(request))) => request,
                Ok(Some(Inbound::Malformed(_))) => {
                    let response = JsonRpcResponse::error(None, ProtocolError::ParseError.into());
                    if let Err(e) = transport.send(&response).await {
                        error!("Failed to send parse error: {}", e);
                    }
                    continue;
                }
                Ok(None) => {
                    debug!("End of input");
                    break Ok(());
                }
                Err(e) => {
                    error!("Transport error: {}", e);
                    break Err(e);
                }
            };

            let method = request.method.clone();
            let notification = request.is_notification();
            self.advance(&method);

            let response = self.dispatcher.dispatch(request).await;
            if !notification && let Err(e) = transport.send(&response).await {
                error!(method = %method, "Failed to send response: {}", e);
            }

            if method == "shutdown" {
                info!("Shutdown requested by client");
                break Ok(());
            }
        };

        *self.phase.write() = Phase::Stopped;
        info!("MCP server stopped");
        outcome
    }

    fn advance(&self, method: &str) {
        let mut phase = self.phase.write();
        *phase = match (*phase, method) {
            (Phase::Created, "initialize") => Phase::Initializing,
            (Phase::Initializing, "initialized" | "notifications/initialized") => {
                info!("Client handshake complete");
                Phase::Running
            }
            (current, _) => current,
        };
    }
}
