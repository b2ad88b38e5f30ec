use std::time::Duration;

use serde::Deserialize;

use crate::gadget::NamespacePolicy;
use crate::gadget::catalog::DEFAULT_IMAGE_TAG;
use crate::mcp::{AccessLevel, Transport};

pub const ENV_PREFIX: &str = "GADGET_MCP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub socket_path: Option<String>,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default = "default_runtime_endpoint")]
    pub runtime_endpoint: String,
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub kube_context: Option<String>,
    #[serde(default)]
    pub chart_version: Option<String>,
    #[serde(default)]
    pub allowed_namespaces: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            transport: Transport::default(),
            socket_path: None,
            access_level: AccessLevel::default(),
            runtime_endpoint: default_runtime_endpoint(),
            image_tag: default_image_tag(),
            kubeconfig: None,
            kube_context: None,
            chart_version: None,
            allowed_namespaces: None,
            command_timeout_secs: default_command_timeout(),
            log_path: None,
        }
    }
}

impl AppConfig {
    /// Reads `GADGET_MCP_*` variables, e.g. `GADGET_MCP_ACCESS_LEVEL=readwrite`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.socket_path = Self::normalize_opt(self.socket_path.take());
        self.kubeconfig = Self::normalize_opt(self.kubeconfig.take());
        self.kube_context = Self::normalize_opt(self.kube_context.take());
        self.chart_version = Self::normalize_opt(self.chart_version.take());
        self.allowed_namespaces = Self::normalize_opt(self.allowed_namespaces.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        let tag = self.image_tag.trim();
        self.image_tag = if tag.is_empty() {
            default_image_tag()
        } else {
            tag.to_string()
        };
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn namespace_policy(&self) -> NamespacePolicy {
        self.allowed_namespaces
            .as_deref()
            .map(NamespacePolicy::parse)
            .unwrap_or_default()
    }
}

fn default_runtime_endpoint() -> String {
    "unix:///var/run/gadget/gadget.sock".to_string()
}

fn default_image_tag() -> String {
    DEFAULT_IMAGE_TAG.to_string()
}

fn default_command_timeout() -> u64 {
    60
}
