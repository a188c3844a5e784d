//! Method routing from JSON-RPC requests to a [`Handler`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::types::*;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Implemented by the server side of the protocol.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult>;

    /// The client finished the handshake.
    async fn initialized(&self) -> ProtocolResult<()>;

    /// Releases backend resources. Must be idempotent.
    async fn shutdown(&self) -> ProtocolResult<()>;

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult>;

    async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult>;

    async fn ping(&self) -> ProtocolResult<Value> {
        Ok(serde_json::json!({}))
    }
}

pub struct Dispatcher<H: Handler> {
    handler: Arc<H>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!("Dispatching request");

        let result = match request.method.as_str() {
            "initialize" => match parse_params::<InitializeParams>(request.params, true) {
                Ok(params) => self.handler.initialize(params).await.and_then(to_value),
                Err(e) => Err(e),
            },
            "initialized" | "notifications/initialized" => {
                self.handler.initialized().await.map(|()| Value::Null)
            }
            "shutdown" => self.handler.shutdown().await.map(|()| Value::Null),
            "ping" => self.handler.ping().await,
            "tools/list" => self.handler.list_tools().await.and_then(to_value),
            "tools/call" => match parse_params::<CallToolParams>(request.params, false) {
                Ok(params) => self.handler.call_tool(params).await.and_then(to_value),
                Err(e) => Err(e),
            },
            method => {
                warn!("Unknown method: {}", method);
                Err(ProtocolError::MethodNotFound(method.to_string()))
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => {
                warn!("Request failed: {}", e);
                JsonRpcResponse::error(request.id, e.into())
            }
        }
    }
}

/// `optional` params default when the client omits them.
fn parse_params<T: DeserializeOwned + Default>(
    params: Option<Value>,
    optional: bool,
) -> ProtocolResult<T> {
    match params {
        Some(params) => serde_json::from_value(params)
            .map_err(|e| ProtocolError::InvalidParams(e.to_string().into())),
        None if optional => Ok(T::default()),
        None => Err(ProtocolError::InvalidParams("Missing params".into())),
    }
}

fn to_value<T: Serialize>(value: T) -> ProtocolResult<Value> {
    serde_json::to_value(value).map_err(|e| ProtocolError::InternalError(e.to_string().into()))
}
