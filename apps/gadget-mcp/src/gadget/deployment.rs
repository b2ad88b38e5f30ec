use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::GadgetError;
use crate::cluster::ClusterClient;

pub const GADGET_POD_SELECTOR: &str = "k8s-app=gadget";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentStatus {
    pub deployed: bool,
    pub namespace: Option<String>,
}

impl DeploymentStatus {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn deployed_in(namespace: impl Into<String>) -> Self {
        Self {
            deployed: true,
            namespace: Some(namespace.into()),
        }
    }
}

/// Answers whether the gadget agent runs in the cluster, and where.
///
/// Every query goes to the control plane; nothing is cached.
pub struct DeploymentOracle {
    cluster: Arc<dyn ClusterClient>,
    selector: String,
}

impl DeploymentOracle {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            selector: GADGET_POD_SELECTOR.to_string(),
        }
    }

    pub async fn status(&self) -> Result<DeploymentStatus, GadgetError> {
        let pods = self.cluster.list_pods(&self.selector).await?;
        if pods.is_empty() {
            info!(selector = %self.selector, "no inspektor gadget pods found");
            return Ok(DeploymentStatus::absent());
        }

        let mut namespaces: Vec<String> = Vec::new();
        for pod in pods {
            if !namespaces.contains(&pod.namespace) {
                namespaces.push(pod.namespace);
            }
        }
        if namespaces.len() > 1 {
            warn!(?namespaces, "inspektor gadget pods span multiple namespaces");
            return Err(GadgetError::AmbiguousDeployment(namespaces));
        }
        Ok(DeploymentStatus::deployed_in(namespaces.remove(0)))
    }

    /// Namespace of the deployment, or [`GadgetError::NotDeployed`].
    pub async fn ensure_deployed(&self) -> Result<String, GadgetError> {
        match self.status().await? {
            DeploymentStatus {
                deployed: true,
                namespace: Some(namespace),
            } => Ok(namespace),
            _ => Err(GadgetError::NotDeployed),
        }
    }
}
