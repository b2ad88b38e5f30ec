//! Client-side view of the gadget runtime.
//!
//! The runtime is the engine that schedules eBPF gadgets onto cluster nodes,
//! streams their events and owns the state of detached instances. This crate
//! only describes the RPC surface callers depend on (`GadgetRuntime`), ships a
//! line-delimited JSON-RPC client for it and an in-memory mock for tests.

pub mod mock;
pub mod rpc;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use rpc::{Endpoint, RpcRuntime};

/// Generic key/value parameters understood by the runtime and its operators.
pub type ParamMap = BTreeMap<String, String>;

/// Data sources carrying this annotation set to `none` are not surfaced by default.
pub const OUTPUT_MODE_ANNOTATION: &str = "cli.default-output-mode";

pub const PARAM_ID: &str = "id";
pub const PARAM_DETACH: &str = "detach";
pub const PARAM_TAGS: &str = "tags";

/// Environment the runtime operates in. Sent once when a connection is set up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Kubernetes,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Kubernetes => "kubernetes",
        }
    }
}

/// What a run attaches to: a fresh gadget image, or an already running instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTarget {
    Image(String),
    Instance(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceInfo {
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl DataSourceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn hidden_by_default(&self) -> bool {
        self.annotations
            .get(OUTPUT_MODE_ANNOTATION)
            .is_some_and(|mode| mode == "none")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GadgetInfo {
    pub name: String,
    #[serde(default)]
    pub data_sources: Vec<DataSourceInfo>,
}

/// A single run issued against the runtime.
///
/// `params` are the gadget/operator parameters, `runtime_params` the instance
/// controls (`id`, `detach`, `tags`). When `timeout` is set the runtime stops
/// the run once it elapses; a detached run returns as soon as it is started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRequest {
    pub target: RunTarget,
    pub params: ParamMap,
    pub runtime_params: ParamMap,
    pub subscriptions: Vec<String>,
    pub timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(target: RunTarget) -> Self {
        Self {
            target,
            params: ParamMap::new(),
            runtime_params: ParamMap::new(),
            subscriptions: Vec::new(),
            timeout: None,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.runtime_params
            .get(PARAM_DETACH)
            .is_some_and(|value| value == "true")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GadgetEvent {
    pub data_source: String,
    pub data: Value,
}

impl GadgetEvent {
    pub fn new(data_source: impl Into<String>, data: Value) -> Self {
        Self {
            data_source: data_source.into(),
            data,
        }
    }
}

/// Detached instance as reported by the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unix seconds.
    #[serde(default)]
    pub time_created: i64,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("runtime rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("gadget instance {0} not found")]
    InstanceNotFound(String),
    #[error("runtime connection closed")]
    Disconnected,
    #[error("runtime call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("unexpected runtime response: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait GadgetRuntime: Send + Sync {
    async fn gadget_info(&self, target: &RunTarget) -> Result<GadgetInfo, RuntimeError>;

    /// Runs a gadget, forwarding events of the subscribed data sources to
    /// `events`. Returns when the run completes, times out, or (for detached
    /// runs) once the instance has been created.
    async fn run_gadget(
        &self,
        request: RunRequest,
        events: mpsc::Sender<GadgetEvent>,
    ) -> Result<(), RuntimeError>;

    async fn remove_instance(&self, id: &str) -> Result<(), RuntimeError>;

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, RuntimeError>;

    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}
