use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{
    Environment, GadgetEvent, GadgetInfo, GadgetRuntime, InstanceRecord, RunRequest, RunTarget,
    RuntimeError,
};

const JSONRPC_VERSION: &str = "2.0";
const EVENT_METHOD: &str = "gadget.event";
pub const ERROR_NOT_FOUND: i64 = -32004;

/// Where the runtime listens: `tcp://host:port`, `unix:///path` or a bare socket path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    pub fn parse(value: &str) -> Self {
        if let Some(addr) = value.strip_prefix("tcp://") {
            Endpoint::Tcp(addr.to_string())
        } else if let Some(path) = value.strip_prefix("unix://") {
            Endpoint::Unix(PathBuf::from(path))
        } else {
            Endpoint::Unix(PathBuf::from(value))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

type PendingReply = oneshot::Sender<Result<Value, RuntimeError>>;

#[derive(Default)]
struct CallTable {
    closed: bool,
    replies: HashMap<u64, PendingReply>,
    streams: HashMap<u64, mpsc::Sender<GadgetEvent>>,
}

#[derive(Default)]
struct Shared {
    table: Mutex<CallTable>,
}

impl Shared {
    fn close(&self) {
        let mut table = self.table.lock();
        table.closed = true;
        for (_, reply) in table.replies.drain() {
            let _ = reply.send(Err(RuntimeError::Disconnected));
        }
        table.streams.clear();
    }
}

/// Removes the call's entries when the call finishes or its future is dropped.
struct CallGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.shared.table.lock();
        table.replies.remove(&self.id);
        table.streams.remove(&self.id);
    }
}

/// One live connection: a writer task, a reader task and the table of calls
/// waiting on it.
struct Connection {
    outgoing: mpsc::Sender<Value>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    async fn open(endpoint: &Endpoint, environment: Environment) -> Result<Self, RuntimeError> {
        debug!(%endpoint, "connecting to gadget runtime");
        match endpoint {
            Endpoint::Unix(path) => {
                let (read_half, write_half) = UnixStream::connect(path).await?.into_split();
                Self::start(read_half, write_half, environment).await
            }
            Endpoint::Tcp(addr) => {
                let (read_half, write_half) = TcpStream::connect(addr.as_str()).await?.into_split();
                Self::start(read_half, write_half, environment).await
            }
        }
    }

    async fn start<R, W>(reader: R, writer: W, environment: Environment) -> Result<Self, RuntimeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Value>(128);
        let shared = Arc::new(Shared::default());
        let writer_task = tokio::spawn(write_loop(writer, rx));
        let reader_task = tokio::spawn(read_loop(BufReader::new(reader), Arc::clone(&shared)));
        let connection = Self {
            outgoing: tx,
            shared,
            next_id: AtomicU64::new(1),
            tasks: vec![writer_task, reader_task],
        };
        connection
            .call("initialize", json!({"environment": environment}), None)
            .await?;
        Ok(connection)
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        stream: Option<mpsc::Sender<GadgetEvent>>,
    ) -> Result<Value, RuntimeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut table = self.shared.table.lock();
            if table.closed {
                return Err(RuntimeError::Disconnected);
            }
            table.replies.insert(id, reply_tx);
            if let Some(stream) = stream {
                table.streams.insert(id, stream);
            }
        }
        let _guard = CallGuard {
            shared: self.shared.as_ref(),
            id,
        };

        let request = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(id, method, "runtime call");
        self.outgoing
            .send(request)
            .await
            .map_err(|_| RuntimeError::Disconnected)?;
        reply_rx.await.map_err(|_| RuntimeError::Disconnected)?
    }

    fn shutdown(&self) {
        self.shared.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// JSON-RPC client for the gadget runtime.
///
/// A single connection is opened on first use and then shared by every
/// caller. Responses are matched by request id and `gadget.event`
/// notifications are routed to the run that owns them, so concurrent runs
/// never see each other's events. A dropped connection is not re-established.
pub struct RpcRuntime {
    endpoint: Option<Endpoint>,
    environment: Environment,
    connection: OnceCell<Connection>,
}

impl RpcRuntime {
    /// Connects lazily, on the first runtime call.
    pub fn new(endpoint: Endpoint, environment: Environment) -> Self {
        Self {
            endpoint: Some(endpoint),
            environment,
            connection: OnceCell::new(),
        }
    }

    pub async fn connect(endpoint: Endpoint, environment: Environment) -> Result<Self, RuntimeError> {
        let runtime = Self::new(endpoint, environment);
        runtime.connection().await?;
        Ok(runtime)
    }

    pub async fn from_io<R, W>(reader: R, writer: W, environment: Environment) -> Result<Self, RuntimeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::start(reader, writer, environment).await?;
        Ok(Self {
            endpoint: None,
            environment,
            connection: OnceCell::new_with(Some(connection)),
        })
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    async fn connection(&self) -> Result<&Connection, RuntimeError> {
        self.connection
            .get_or_try_init(|| async {
                let endpoint = self.endpoint.as_ref().ok_or(RuntimeError::Disconnected)?;
                Connection::open(endpoint, self.environment).await
            })
            .await
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        stream: Option<mpsc::Sender<GadgetEvent>>,
    ) -> Result<Value, RuntimeError> {
        self.connection().await?.call(method, params, stream).await
    }
}

#[async_trait]
impl GadgetRuntime for RpcRuntime {
    async fn gadget_info(&self, target: &RunTarget) -> Result<GadgetInfo, RuntimeError> {
        let value = self
            .call("gadget.info", json!({"target": target}), None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn run_gadget(
        &self,
        request: RunRequest,
        events: mpsc::Sender<GadgetEvent>,
    ) -> Result<(), RuntimeError> {
        // a detached run only reports that the instance exists
        let stream = (!request.is_detached()).then_some(events);
        let params = json!({
            "target": request.target,
            "params": request.params,
            "runtimeParams": request.runtime_params,
            "subscriptions": request.subscriptions,
            "timeoutMs": request.timeout.map(|timeout| timeout.as_millis() as u64),
        });
        self.call("gadget.run", params, stream).await?;
        Ok(())
    }

    async fn remove_instance(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .call("gadget.removeInstance", json!({"id": id}), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(RuntimeError::Rejected {
                code: ERROR_NOT_FOUND,
                ..
            }) => Err(RuntimeError::InstanceNotFound(id.to_string())),
            Err(err) => Err(err),
        }
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, RuntimeError> {
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            instances: Vec<InstanceRecord>,
        }
        let value = self.call("gadget.listInstances", json!({}), None).await?;
        let listing: Listing = serde_json::from_value(value)?;
        Ok(listing.instances)
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        if let Some(connection) = self.connection.get() {
            connection.shutdown();
        }
        Ok(())
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Value>)
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
                error!(error = %err, "failed to serialize runtime request");
            }
        }
    }
}

async fn read_loop<R>(mut reader: BufReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
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
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(message) => dispatch(&shared, message).await,
                    Err(err) => warn!(error = %err, "failed to parse runtime message"),
                }
            }
            Err(err) => {
                warn!(error = %err, "runtime connection read error");
                break;
            }
        }
    }
    debug!("runtime connection closed");
    shared.close();
}

async fn dispatch(shared: &Shared, message: Value) {
    if message.get("method").and_then(Value::as_str) == Some(EVENT_METHOD) {
        let Some(params) = message.get("params") else {
            return;
        };
        let Some(run_id) = params.get("runId").and_then(Value::as_u64) else {
            warn!("runtime event without runId");
            return;
        };
        let event = match serde_json::from_value::<GadgetEvent>(params.clone()) {
            Ok(event) => event,
            Err(err) => {
                warn!(run_id, error = %err, "malformed runtime event");
                return;
            }
        };
        let stream = shared.table.lock().streams.get(&run_id).cloned();
        // late events for finished or cancelled runs are dropped
        let Some(stream) = stream else {
            return;
        };
        // the reader serves every call on the connection and must never wait on one run
        match stream.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                warn!(run_id, "event consumer lagging, dropping runtime event");
            }
        }
        return;
    }

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        debug!("ignoring runtime message without id");
        return;
    };
    let Some(reply) = shared.table.lock().replies.remove(&id) else {
        return;
    };
    let outcome = match message.get("error") {
        Some(error) => Err(RuntimeError::Rejected {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
        None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = reply.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Responder = Box<dyn Fn(&Value) -> Vec<Value> + Send>;

    fn reply(request: &Value, result: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": request["id"], "result": result})
    }

    fn event(run_id: &Value, data_source: &str, data: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "gadget.event",
            "params": {"runId": run_id, "dataSource": data_source, "data": data}
        })
    }

    /// Serves requests one by one, writing whatever the responder returns.
    fn spawn_fake_runtime(server: DuplexStream, responder: Responder) -> JoinHandle<Vec<Value>> {
        tokio::spawn(async move {
            let (read_half, mut write_half): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
                tokio::io::split(server);
            let mut reader = BufReader::new(read_half);
            let mut seen = Vec::new();
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let request: Value = serde_json::from_str(line.trim()).unwrap();
                for message in responder(&request) {
                    let mut text = serde_json::to_string(&message).unwrap();
                    text.push('\n');
                    write_half.write_all(text.as_bytes()).await.unwrap();
                }
                seen.push(request);
            }
            seen
        })
    }

    async fn connect(responder: Responder) -> (RpcRuntime, JoinHandle<Vec<Value>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let fake = spawn_fake_runtime(server, responder);
        let (read_half, write_half) = tokio::io::split(client);
        let runtime = RpcRuntime::from_io(read_half, write_half, Environment::Kubernetes)
            .await
            .unwrap();
        (runtime, fake)
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:9000"),
            Endpoint::Tcp("127.0.0.1:9000".into())
        );
        assert_eq!(
            Endpoint::parse("unix:///run/gadget.sock"),
            Endpoint::Unix(PathBuf::from("/run/gadget.sock"))
        );
        assert_eq!(
            Endpoint::parse("/tmp/runtime.sock"),
            Endpoint::Unix(PathBuf::from("/tmp/runtime.sock"))
        );
        assert_eq!(Endpoint::parse("tcp://host:1").to_string(), "tcp://host:1");
    }

    #[tokio::test]
    async fn connects_on_first_use() {
        let endpoint = Endpoint::parse("/nonexistent/gadget-runtime.sock");
        let runtime = RpcRuntime::new(endpoint.clone(), Environment::Kubernetes);
        assert_eq!(runtime.endpoint(), Some(&endpoint));
        let err = runtime.list_instances().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Io(_)));
        runtime.close().await.unwrap();
    }

    #[tokio::test]
    async fn initialize_announces_environment() {
        let (runtime, fake) = connect(Box::new(|request| vec![reply(request, json!({}))])).await;
        runtime.close().await.unwrap();
        drop(runtime);
        let seen = fake.await.unwrap();
        assert_eq!(seen[0]["method"], "initialize");
        assert_eq!(seen[0]["params"]["environment"], "kubernetes");
    }

    #[tokio::test]
    async fn lists_instances() {
        let (runtime, _fake) = connect(Box::new(|request| {
            let result = match request["method"].as_str() {
                Some("gadget.listInstances") => json!({
                    "instances": [
                        {"id": "a1", "tags": ["tool-name=x"], "timeCreated": 1700000000},
                        {"id": "b2"}
                    ]
                }),
                _ => json!({}),
            };
            vec![reply(request, result)]
        }))
        .await;

        let instances = runtime.list_instances().await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "a1");
        assert_eq!(instances[0].tags, vec!["tool-name=x".to_string()]);
        assert_eq!(instances[0].time_created, 1_700_000_000);
        assert!(instances[1].tags.is_empty());
    }

    #[tokio::test]
    async fn routes_events_to_their_run() {
        let (runtime, fake) = connect(Box::new(|request| match request["method"].as_str() {
            Some("gadget.run") => {
                let image = request["params"]["target"]["image"].as_str().unwrap().to_string();
                vec![
                    event(&request["id"], "events", json!({"image": image, "seq": 1})),
                    event(&json!(9999), "events", json!({"stray": true})),
                    event(&request["id"], "events", json!({"image": image, "seq": 2})),
                    reply(request, json!({})),
                ]
            }
            _ => vec![reply(request, json!({}))],
        }))
        .await;

        let runtime = Arc::new(runtime);
        let run = |image: &'static str| {
            let runtime = Arc::clone(&runtime);
            async move {
                let (tx, mut rx) = mpsc::channel::<GadgetEvent>(16);
                let mut request = RunRequest::new(RunTarget::Image(image.into()));
                request.subscriptions.push("events".into());
                request.timeout = Some(Duration::from_secs(2));
                let collect = async {
                    let mut seen = Vec::new();
                    while let Some(event) = rx.recv().await {
                        seen.push(event.data);
                    }
                    seen
                };
                let (result, seen) = tokio::join!(runtime.run_gadget(request, tx), collect);
                result.unwrap();
                seen
            }
        };

        let (dns, tcp) = tokio::join!(run("trace_dns"), run("trace_tcp"));
        assert_eq!(dns.len(), 2);
        assert!(dns.iter().all(|data| data["image"] == "trace_dns"));
        assert_eq!(tcp.len(), 2);
        assert!(tcp.iter().all(|data| data["image"] == "trace_tcp"));

        runtime.close().await.unwrap();
        drop(runtime);
        let seen = fake.await.unwrap();
        let run_request = seen
            .iter()
            .find(|request| request["method"] == "gadget.run")
            .unwrap();
        assert_eq!(run_request["params"]["timeoutMs"], 2000);
        assert_eq!(run_request["params"]["subscriptions"], json!(["events"]));
    }

    #[tokio::test]
    async fn maps_not_found_on_remove() {
        let (runtime, _fake) = connect(Box::new(|request| match request["method"].as_str() {
            Some("gadget.removeInstance") => vec![json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": ERROR_NOT_FOUND, "message": "no such instance"}
            })],
            Some("gadget.info") => vec![json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32602, "message": "bad image"}
            })],
            _ => vec![reply(request, json!({}))],
        }))
        .await;

        let err = runtime.remove_instance("deadbeef").await.unwrap_err();
        assert!(matches!(err, RuntimeError::InstanceNotFound(ref id) if id == "deadbeef"));

        let err = runtime
            .gadget_info(&RunTarget::Image("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Rejected { code: -32602, .. }));
    }

    #[tokio::test]
    async fn pending_calls_fail_when_connection_drops() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let fake = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: Value = serde_json::from_str(line.trim()).unwrap();
            let mut text = serde_json::to_string(&reply(&request, json!({}))).unwrap();
            text.push('\n');
            write_half.write_all(text.as_bytes()).await.unwrap();
            // swallow the next request, then hang up
            line.clear();
            reader.read_line(&mut line).await.unwrap();
        });
        let (read_half, write_half) = tokio::io::split(client);
        let runtime = RpcRuntime::from_io(read_half, write_half, Environment::Kubernetes)
            .await
            .unwrap();

        let err = runtime.list_instances().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Disconnected));
        fake.await.unwrap();

        let err = runtime.list_instances().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Disconnected));
    }

    fn chatty_runtime() -> Responder {
        Box::new(|request| match request["method"].as_str() {
            Some("gadget.run") => {
                let mut messages: Vec<Value> = (0..3)
                    .map(|seq| event(&request["id"], "events", json!({"seq": seq})))
                    .collect();
                messages.push(reply(request, json!({})));
                messages
            }
            Some("gadget.listInstances") => {
                vec![reply(request, json!({"instances": [{"id": "a1"}]}))]
            }
            _ => vec![reply(request, json!({}))],
        })
    }

    #[tokio::test]
    async fn detached_run_events_do_not_stall_connection() {
        let (runtime, _fake) = connect(chatty_runtime()).await;
        let mut request = RunRequest::new(RunTarget::Image("trace_dns".into()));
        request.subscriptions.push("events".into());
        request.runtime_params.insert(crate::PARAM_ID.into(), "a1".into());
        request.runtime_params.insert(crate::PARAM_DETACH.into(), "true".into());
        // held but never read
        let (tx, mut rx) = mpsc::channel(1);

        tokio::time::timeout(Duration::from_secs(5), async {
            runtime.run_gadget(request, tx).await.unwrap();
            let instances = runtime.list_instances().await.unwrap();
            assert_eq!(instances[0].id, "a1");
        })
        .await
        .expect("connection stalled");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lagging_consumer_loses_events_not_replies() {
        let (runtime, _fake) = connect(chatty_runtime()).await;
        let mut request = RunRequest::new(RunTarget::Image("trace_dns".into()));
        request.subscriptions.push("events".into());
        let (tx, mut rx) = mpsc::channel(1);

        tokio::time::timeout(Duration::from_secs(5), async {
            runtime.run_gadget(request, tx).await.unwrap();
            assert_eq!(runtime.list_instances().await.unwrap().len(), 1);
        })
        .await
        .expect("connection stalled");
        assert_eq!(rx.try_recv().unwrap().data["seq"], 0);
        assert!(rx.try_recv().is_err());
    }
}
