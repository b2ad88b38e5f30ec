use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use gadget_mcp::mcp::protocol::ToolCallResult;

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Line-delimited JSON-RPC client that drives the server from integration tests.
pub struct McpClient {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    next_id: AtomicU64,
}

impl McpClient {
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_io(read_half, write_half))
    }

    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn initialize(&mut self) -> Result<Value, McpClientError> {
        let result = self
            .call_method("initialize", json!({"clientInfo": {"name": "gadget-mcp-client"}}))
            .await?;
        self.notify("notifications/initialized").await?;
        Ok(result)
    }

    pub async fn ping(&mut self) -> Result<(), McpClientError> {
        self.call_method("ping", json!({})).await?;
        Ok(())
    }

    pub async fn list_tools(&mut self) -> Result<Vec<Value>, McpClientError> {
        let response = self.call_method("tools/list", json!({})).await?;
        let tools = response
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools)
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpClientError> {
        let result = self
            .call_method(
                "tools/call",
                json!({
                    "name": name,
                    "arguments": arguments
                }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn notify(&mut self, method: &str) -> Result<(), McpClientError> {
        self.write(&json!({"jsonrpc": "2.0", "method": method})).await
    }

    async fn write(&mut self, message: &Value) -> Result<(), McpClientError> {
        let mut encoded = serde_json::to_string(message)?;
        encoded.push('\n');
        self.writer.write_all(encoded.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn call_method(&mut self, method: &str, params: Value) -> Result<Value, McpClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.reader.read_line(&mut line).await?;
            if read == 0 {
                return Err(McpClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "mcp server closed connection",
                )));
            }
            let value: Value = serde_json::from_str(&line)?;
            let Some(response_id) = value.get("id") else {
                continue;
            };
            if !matches_id(response_id, id) {
                continue;
            }
            if let Some(error) = value.get("error") {
                return Err(McpClientError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                });
            }
            return Ok(value.get("result").cloned().unwrap_or(Value::Null));
        }
    }
}

fn matches_id(value: &Value, expected: u64) -> bool {
    match value {
        Value::Number(num) => num.as_u64() == Some(expected),
        Value::String(text) => text.parse::<u64>().ok() == Some(expected),
        _ => false,
    }
}

#[derive(Debug, Error)]
pub enum McpClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}
