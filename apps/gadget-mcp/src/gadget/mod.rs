//! Gadget lifecycle on top of the runtime: probe catalog, parameter
//! translation, result collection, deployment discovery and the chart
//! deploy executor.

pub mod catalog;
pub mod deploy;
pub mod deployment;
pub mod manager;
pub mod params;
pub mod results;

use chrono::{DateTime, Utc};
use gadget_runtime::{InstanceRecord, RuntimeError};
use serde::Serialize;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::command::CommandError;

pub use catalog::ProbeKind;
pub use deploy::{ChartDeployer, NamespacePolicy};
pub use deployment::{DeploymentOracle, DeploymentStatus};
pub use manager::GadgetManager;
pub use results::{ResultBuffer, truncate_results};

#[derive(Debug, Error)]
pub enum GadgetError {
    #[error("inspektor gadget is not deployed, please deploy it first using 'inspektor_gadget_deploy' tool")]
    NotDeployed,
    #[error("inspektor gadget is already deployed in namespace {0}")]
    AlreadyDeployed(String),
    #[error("multiple namespaces found for inspektor gadget pods: {}", .0.join(", "))]
    AmbiguousDeployment(Vec<String>),
    #[error("invalid or missing '{0}' parameter, must be a non-empty string")]
    MissingParameter(&'static str),
    #[error("invalid 'duration' parameter: {0}")]
    InvalidDuration(String),
    #[error("namespace {0} is not allowed by the configured namespace policy")]
    NamespaceNotAllowed(String),
    #[error("{action}: {source}")]
    Runtime {
        action: &'static str,
        #[source]
        source: RuntimeError,
    },
    #[error("checking inspektor gadget deployment: {0}")]
    ControlPlane(#[from] ClusterError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("generating gadget id: {0}")]
    IdGeneration(#[from] rand::Error),
    #[error("encoding response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl GadgetError {
    pub(crate) fn runtime(action: &'static str) -> impl FnOnce(RuntimeError) -> Self {
        move |source| GadgetError::Runtime { action, source }
    }

    /// Stable machine-readable category, surfaced to tool callers.
    pub fn kind(&self) -> &'static str {
        match self {
            GadgetError::NotDeployed => "not_deployed",
            GadgetError::AlreadyDeployed(_) => "already_deployed",
            GadgetError::AmbiguousDeployment(_) => "ambiguous_deployment",
            GadgetError::MissingParameter(_) | GadgetError::InvalidDuration(_) => "invalid_params",
            GadgetError::NamespaceNotAllowed(_) => "forbidden",
            GadgetError::Runtime { .. } => "runtime",
            GadgetError::ControlPlane(_) => "control_plane",
            GadgetError::Command(_) => "command",
            GadgetError::IdGeneration(_) | GadgetError::Encode(_) => "internal",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GadgetSummary {
    pub name: String,
    pub image: String,
}

/// A detached gadget as reported to tool callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GadgetInstance {
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl From<InstanceRecord> for GadgetInstance {
    fn from(record: InstanceRecord) -> Self {
        Self {
            id: record.id,
            tags: record.tags,
            started_at: DateTime::from_timestamp(record.time_created, 0).unwrap_or_default(),
        }
    }
}
