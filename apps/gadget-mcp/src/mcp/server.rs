use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mcp::handlers::{GadgetTools, ToolError};
use crate::mcp::protocol::{
    ERROR_INVALID_REQUEST, ERROR_PARSE, JSONRPC_VERSION, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResult, MCP_PROTOCOL_VERSION, ToolCallResult, error_response, internal_error,
    invalid_params, method_not_found,
};
use crate::mcp::{McpConfig, Transport};

pub const SERVER_NAME: &str = "gadget-mcp";

pub struct McpServer {
    config: McpConfig,
    service: Arc<McpService>,
}

struct SocketCleanup(PathBuf);

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %err, "failed to clean mcp socket");
            }
        }
    }
}

impl McpServer {
    pub fn new(config: McpConfig, tools: GadgetTools) -> Self {
        let service = Arc::new(McpService { tools });
        Self { config, service }
    }

    pub fn handle(&self) -> McpServerHandle {
        McpServerHandle {
            service: Arc::clone(&self.service),
        }
    }

    pub async fn run(self) -> Result<()> {
        match self.config.transport {
            Transport::Stdio => self.run_stdio().await,
            Transport::Socket => self.run_socket().await,
        }
    }

    async fn run_stdio(self) -> Result<()> {
        info!("MCP server serving stdio");
        handle_connection(io::stdin(), io::stdout(), Arc::clone(&self.service)).await;
        Ok(())
    }

    async fn run_socket(self) -> Result<()> {
        let path = self
            .config
            .socket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("MCP socket path missing"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create socket dir {parent:?}"))?;
        }
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove existing socket {path:?}"))?;
        }
        let listener =
            UnixListener::bind(&path).with_context(|| format!("bind MCP socket at {path:?}"))?;
        let _cleanup = SocketCleanup(path.clone());
        info!(socket = %path.display(), "MCP server listening");

        loop {
            let (stream, _) = listener.accept().await?;
            debug!("accepted MCP connection");
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                handle_unix_stream(stream, service).await;
            });
        }
    }
}

/// Serves additional connections against the same tools, e.g. in-process streams.
#[derive(Clone)]
pub struct McpServerHandle {
    service: Arc<McpService>,
}

impl McpServerHandle {
    pub fn spawn_connection<R, W>(&self, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            handle_connection(reader, writer, service).await;
        })
    }
}

async fn handle_unix_stream(stream: UnixStream, service: Arc<McpService>) {
    let (read_half, write_half) = stream.into_split();
    handle_connection(read_half, write_half, service).await;
}

async fn handle_connection<R, W>(reader: R, writer: W, service: Arc<McpService>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Value>(128);
    let writer_task = tokio::spawn(async move {
        write_loop(writer, &mut rx).await;
    });

    let mut in_flight = Vec::new();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let request = match parse_request(trimmed) {
                    Ok(request) => request,
                    Err(response) => {
                        if send(&tx, response).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                // tool calls can run for the whole observation window, so
                // each request is served on its own task
                let service = Arc::clone(&service);
                let tx = tx.clone();
                in_flight.retain(|task: &JoinHandle<()>| !task.is_finished());
                in_flight.push(tokio::spawn(async move {
                    if let Some(response) = service.handle_request(request).await {
                        let _ = send(&tx, response).await;
                    }
                }));
            }
            Err(err) => {
                warn!(error = %err, "connection read error");
                break;
            }
        }
    }

    // let outstanding calls answer before the writer goes away
    for task in in_flight {
        let _ = task.await;
    }
    drop(tx);
    let _ = writer_task.await;
}

fn parse_request(line: &str) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value = serde_json::from_str::<Value>(line).map_err(|err| {
        warn!(error = %err, "failed to parse JSON payload");
        error_response(None, ERROR_PARSE, "invalid json", None)
    })?;
    let request = serde_json::from_value::<JsonRpcRequest>(value.clone()).map_err(|err| {
        warn!(error = %err, "invalid JSON-RPC request");
        error_response(None, ERROR_INVALID_REQUEST, "invalid request", Some(value))
    })?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(error_response(
            request.id.clone(),
            ERROR_INVALID_REQUEST,
            "jsonrpc version must be 2.0",
            None,
        ));
    }
    Ok(request)
}

async fn send(tx: &mpsc::Sender<Value>, response: JsonRpcResponse) -> Result<(), ()> {
    match serde_json::to_value(response) {
        Ok(value) => tx.send(value).await.map_err(|_| ()),
        Err(err) => {
            error!(error = %err, "failed to encode response");
            Ok(())
        }
    }
}

async fn write_loop<W>(mut writer: W, rx: &mut mpsc::Receiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        match serde_json::to_string(&message) {
            Ok(mut text) => {
                text.push('\n');
                if writer.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            Err(err) => {
                error!(error = %err, "failed to serialize json");
            }
        }
    }
}

struct McpService {
    tools: GadgetTools,
}

impl McpService {
    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let method = request.method.as_str();
        let params = request.params.unwrap_or_else(|| json!({}));
        let Some(id) = request.id else {
            debug!(method, "ignoring notification");
            return None;
        };
        let response = match method {
            "initialize" => JsonRpcResponse::Result(JsonRpcResult::new(id, self.initialize())),
            "ping" => JsonRpcResponse::Result(JsonRpcResult::new(id, json!({}))),
            "tools/list" => JsonRpcResponse::Result(JsonRpcResult::new(
                id,
                json!({"tools": self.tools.list()}),
            )),
            "tools/call" => match self.tools_call(&params).await {
                Ok(value) => JsonRpcResponse::Result(JsonRpcResult::new(id, value)),
                Err(err) => err.into_response(Some(id)),
            },
            _ => method_not_found(Some(id), method),
        };
        Some(response)
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "instructions": format!(
                "Observe Kubernetes workloads with Inspektor Gadget (access level: {}).",
                self.tools.access().as_str()
            ),
        })
    }

    async fn tools_call(&self, params: &Value) -> Result<Value, McpError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid("tool name missing"))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        if !arguments.is_object() {
            return Err(McpError::invalid("tool arguments must be an object"));
        }

        let result = match self.tools.call(name, &arguments).await {
            Ok(text) => ToolCallResult::text(text),
            Err(ToolError::UnknownTool(name)) => {
                return Err(McpError::invalid(format!("unknown tool: {name}")));
            }
            Err(ToolError::Gadget(err)) => {
                warn!(tool = name, kind = err.kind(), error = %err, "tool call failed");
                ToolCallResult::error(err.kind(), err.to_string())
            }
        };
        serde_json::to_value(result).map_err(|err| McpError::Internal(err.to_string()))
    }
}

#[derive(Debug)]
enum McpError {
    Invalid(String),
    Internal(String),
}

impl McpError {
    fn invalid(message: impl Into<String>) -> Self {
        McpError::Invalid(message.into())
    }

    fn into_response(self, id: Option<Value>) -> JsonRpcResponse {
        match self {
            McpError::Invalid(message) => invalid_params(id, message),
            McpError::Internal(message) => internal_error(id, message),
        }
    }
}
