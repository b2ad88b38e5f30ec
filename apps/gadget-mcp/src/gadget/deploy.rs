use std::sync::Arc;

use tracing::info;

use super::{DeploymentOracle, GadgetError};
use crate::command::CommandRunner;

pub const CHART_RELEASE: &str = "gadget";
pub const CHART_NAMESPACE: &str = "gadget";
pub const CHART_URL: &str = "oci://ghcr.io/inspektor-gadget/inspektor-gadget/charts/gadget";

/// Namespaces the server may modify. Empty allows every namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespacePolicy {
    allowed: Vec<String>,
}

impl NamespacePolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// Parses a comma separated list, ignoring blank entries.
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|namespace| !namespace.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn is_allowed(&self, namespace: &str) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|allowed| allowed == namespace)
    }

    fn check(&self, namespace: &str) -> Result<(), GadgetError> {
        if self.is_allowed(namespace) {
            Ok(())
        } else {
            Err(GadgetError::NamespaceNotAllowed(namespace.to_string()))
        }
    }
}

/// Installs and removes the gadget agent with `helm`.
pub struct ChartDeployer {
    runner: Arc<dyn CommandRunner>,
    oracle: Arc<DeploymentOracle>,
    policy: NamespacePolicy,
    default_version: Option<String>,
    kube_args: Vec<String>,
}

impl ChartDeployer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        oracle: Arc<DeploymentOracle>,
        policy: NamespacePolicy,
        default_version: Option<String>,
    ) -> Self {
        Self {
            runner,
            oracle,
            policy,
            default_version,
            kube_args: Vec::new(),
        }
    }

    /// Points helm at the same cluster as kubectl.
    pub fn with_kube_target(mut self, kubeconfig: Option<String>, context: Option<String>) -> Self {
        self.kube_args.clear();
        if let Some(kubeconfig) = kubeconfig {
            self.kube_args.extend(["--kubeconfig".to_string(), kubeconfig]);
        }
        if let Some(context) = context {
            self.kube_args.extend(["--kube-context".to_string(), context]);
        }
        self
    }

    /// Installs the chart. `chart_version` overrides the configured version;
    /// with neither set the registry's latest chart is used.
    pub async fn deploy(&self, chart_version: Option<&str>) -> Result<String, GadgetError> {
        let status = self.oracle.status().await?;
        if status.deployed {
            return Err(GadgetError::AlreadyDeployed(
                status.namespace.unwrap_or_default(),
            ));
        }
        self.policy.check(CHART_NAMESPACE)?;

        let version = chart_version
            .filter(|version| !version.is_empty())
            .or(self.default_version.as_deref());
        let chart = match version {
            Some(version) => format!("{CHART_URL}:{version}"),
            None => CHART_URL.to_string(),
        };
        info!(%chart, namespace = CHART_NAMESPACE, "installing inspektor gadget");
        let args = self.helm_args(&[
            "install",
            CHART_RELEASE,
            "-n",
            CHART_NAMESPACE,
            "--create-namespace",
            &chart,
        ]);
        Ok(self.runner.run("helm", &args).await?)
    }

    pub async fn undeploy(&self) -> Result<String, GadgetError> {
        self.policy.check(CHART_NAMESPACE)?;
        info!(namespace = CHART_NAMESPACE, "uninstalling inspektor gadget");
        let args = self.helm_args(&["uninstall", CHART_RELEASE, "-n", CHART_NAMESPACE]);
        Ok(self.runner.run("helm", &args).await?)
    }

    fn helm_args(&self, command: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = command.iter().map(|arg| arg.to_string()).collect();
        args.extend(self.kube_args.iter().cloned());
        args
    }
}
