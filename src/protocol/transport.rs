//! Newline-delimited JSON-RPC over a byte stream. Stdio in production,
//! in-memory pipes in tests.

use crate::error::{McpError, Result};
use crate::protocol::types::{JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// One decoded line from the client.
#[derive(Debug)]
pub enum Inbound {
    Request(JsonRpcRequest),
    /// A line that is not a JSON-RPC request.
    Malformed(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Next inbound message, `None` at end of input.
    async fn receive(&self) -> Result<Option<Inbound>>;
    async fn send(&self, response: &JsonRpcResponse) -> Result<()>;
}

pub struct LineTransport<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
}

/// The transport the binary runs on.
pub type StdioTransport = LineTransport<Stdin, Stdout>;

impl StdioTransport {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn receive(&self) -> Result<Option<Inbound>> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.map_err(McpError::Io)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            trace!("Received line: {}", trimmed);

            return Ok(Some(match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => {
                    debug!(method = %request.method, "Received request");
                    Inbound::Request(request)
                }
                Err(e) => {
                    warn!("Failed to parse message: {}", e);
                    Inbound::Malformed(trimmed.to_string())
                }
            }));
        }
    }

    async fn send(&self, response: &JsonRpcResponse) -> Result<()> {
        let json = serde_json::to_string(response)?;
        trace!("Sending line: {}", json);
        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::RequestId;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn test_reads_requests_and_skips_blank_lines() {
        let input: &[u8] = b"\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n\nnot json\n";
        let transport = LineTransport::new(input, Vec::new());

        match transport.receive().await.unwrap() {
            Some(Inbound::Request(request)) => {
                assert_eq!(request.method, "ping");
                assert_eq!(request.id, Some(RequestId::Number(1)));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            transport.receive().await.unwrap(),
            Some(Inbound::Malformed(line)) if line == "not json"
        ));
        assert!(transport.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writes_one_line_per_response() {
        let (client, server) = duplex(4096);
        let transport = LineTransport::new(tokio::io::empty(), server);
        transport
            .send(&JsonRpcResponse::success(Some(7.into()), json!({})))
            .await
            .unwrap();
        drop(transport);

        let mut written = String::new();
        let mut client = client;
        client.read_to_string(&mut written).await.unwrap();
        assert!(written.ends_with('\n'));
        let response: JsonRpcResponse = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(response.id, Some(RequestId::Number(7)));
    }
}
