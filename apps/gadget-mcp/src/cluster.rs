//! Read-only view of the Kubernetes control plane.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::command::{CommandError, CommandRunner};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
}

impl PodSummary {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("failed to decode pod list: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Pods matching `label_selector` across all namespaces.
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodSummary>, ClusterError>;
}

/// Talks to the cluster through the `kubectl` binary.
pub struct KubectlClient {
    runner: Arc<dyn CommandRunner>,
    kubeconfig: Option<String>,
    context: Option<String>,
}

impl KubectlClient {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            kubeconfig: None,
            context: None,
        }
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<String>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    fn args(&self, command: &[&str]) -> Vec<String> {
        let mut args = Vec::with_capacity(command.len() + 4);
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.clone());
        }
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.extend(command.iter().map(|arg| arg.to_string()));
        args
    }
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodSummary>, ClusterError> {
        let args = self.args(&[
            "get",
            "pods",
            "--all-namespaces",
            "-l",
            label_selector,
            "-o",
            "json",
        ]);
        let output = self.runner.run("kubectl", &args).await?;
        let pods = parse_pod_list(&output)?;
        debug!(label_selector, count = pods.len(), "listed pods");
        Ok(pods)
    }
}

fn parse_pod_list(raw: &str) -> Result<Vec<PodSummary>, serde_json::Error> {
    #[derive(Deserialize)]
    struct PodList {
        #[serde(default)]
        items: Vec<Pod>,
    }

    #[derive(Deserialize)]
    struct Pod {
        metadata: Metadata,
    }

    #[derive(Deserialize)]
    struct Metadata {
        name: String,
        #[serde(default)]
        namespace: String,
    }

    let list: PodList = serde_json::from_str(raw)?;
    Ok(list
        .items
        .into_iter()
        .map(|pod| PodSummary::new(pod.metadata.name, pod.metadata.namespace))
        .collect())
}

pub mod mock {
    use parking_lot::Mutex;

    use super::*;

    /// Cluster stub serving a fixed pod list.
    #[derive(Default)]
    pub struct StaticCluster {
        pods: Mutex<Vec<PodSummary>>,
        selectors: Mutex<Vec<String>>,
        unreachable: Mutex<bool>,
    }

    impl StaticCluster {
        pub fn new(pods: Vec<PodSummary>) -> Self {
            Self {
                pods: Mutex::new(pods),
                ..Self::default()
            }
        }

        pub fn set_pods(&self, pods: Vec<PodSummary>) {
            *self.pods.lock() = pods;
        }

        /// Makes every subsequent query fail as if `kubectl` could not reach the API server.
        pub fn set_unreachable(&self, unreachable: bool) {
            *self.unreachable.lock() = unreachable;
        }

        pub fn selectors(&self) -> Vec<String> {
            self.selectors.lock().clone()
        }
    }

    #[async_trait]
    impl ClusterClient for StaticCluster {
        async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodSummary>, ClusterError> {
            self.selectors.lock().push(label_selector.to_string());
            if *self.unreachable.lock() {
                return Err(ClusterError::Command(CommandError::Failed {
                    program: "kubectl".into(),
                    status: "exit status: 1".into(),
                    stderr: "The connection to the server was refused".into(),
                }));
            }
            Ok(self.pods.lock().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;

    const POD_LIST: &str = r#"{
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {"metadata": {"name": "gadget-abcde", "namespace": "gadget", "labels": {"k8s-app": "gadget"}}},
            {"metadata": {"name": "gadget-fghij", "namespace": "gadget"}}
        ]
    }"#;

    #[tokio::test]
    async fn lists_pods_through_kubectl() {
        let runner = Arc::new(ScriptedRunner::new(vec![Ok(POD_LIST.to_string())]));
        let client = KubectlClient::new(runner.clone())
            .with_kubeconfig(Some("/tmp/kubeconfig".into()))
            .with_context(Some("staging".into()));

        let pods = client.list_pods("k8s-app=gadget").await.unwrap();
        assert_eq!(
            pods,
            vec![
                PodSummary::new("gadget-abcde", "gadget"),
                PodSummary::new("gadget-fghij", "gadget"),
            ]
        );

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        let (program, args) = &invocations[0];
        assert_eq!(program, "kubectl");
        assert_eq!(
            args,
            &[
                "--kubeconfig",
                "/tmp/kubeconfig",
                "--context",
                "staging",
                "get",
                "pods",
                "--all-namespaces",
                "-l",
                "k8s-app=gadget",
                "-o",
                "json",
            ]
        );
    }

    #[tokio::test]
    async fn empty_list_has_no_pods() {
        let runner = Arc::new(ScriptedRunner::new(vec![Ok(
            r#"{"kind": "List", "items": []}"#.to_string()
        )]));
        let pods = KubectlClient::new(runner).list_pods("k8s-app=gadget").await.unwrap();
        assert!(pods.is_empty());
    }

    #[tokio::test]
    async fn garbage_output_is_a_decode_error() {
        let runner = Arc::new(ScriptedRunner::new(vec![Ok("error: not json".to_string())]));
        let err = KubectlClient::new(runner)
            .list_pods("k8s-app=gadget")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Decode(_)));
    }
}
