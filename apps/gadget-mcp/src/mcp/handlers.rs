//! Tool call dispatch: validates arguments, checks the deployment and hands
//! off to the coordinator or the chart deployer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use super::AccessLevel;
use super::tools::{self, DEFAULT_DURATION_SECS, MAX_DURATION_SECS};
use crate::gadget::params::{self, RequestParams};
use crate::gadget::{ChartDeployer, DeploymentOracle, GadgetError, GadgetManager, ProbeKind};

/// Tag attached to detached gadgets, naming the tool that started them.
pub const TOOL_NAME_TAG: &str = "tool-name";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    Gadget(#[from] GadgetError),
}

pub struct GadgetTools {
    manager: Arc<GadgetManager>,
    oracle: Arc<DeploymentOracle>,
    deployer: Option<Arc<ChartDeployer>>,
    image_tag: String,
    access: AccessLevel,
}

impl GadgetTools {
    pub fn new(
        manager: Arc<GadgetManager>,
        oracle: Arc<DeploymentOracle>,
        image_tag: impl Into<String>,
        access: AccessLevel,
    ) -> Self {
        Self {
            manager,
            oracle,
            deployer: None,
            image_tag: image_tag.into(),
            access,
        }
    }

    pub fn with_deployer(mut self, deployer: Arc<ChartDeployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub fn list(&self) -> Vec<tools::ToolDescriptor> {
        let mut listed = tools::list_tools(self.access);
        if self.deployer.is_none() {
            listed.retain(|tool| tool.name != tools::DEPLOY && tool.name != tools::UNDEPLOY);
        }
        listed
    }

    /// Executes a tool and returns the text handed back to the caller.
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<String, ToolError> {
        if !tools::is_available(name, self.access) {
            return Err(ToolError::UnknownTool(name.to_string()));
        }
        let arguments: RequestParams = arguments.as_object().cloned().unwrap_or_default();
        info!(tool = name, "tool call");

        if let Some(kind) = ProbeKind::from_tool_name(name) {
            return Ok(self.observe(kind, arguments).await?);
        }
        let outcome = match name {
            tools::GET_RESULTS => {
                let id = required_id(&arguments)?;
                self.oracle.ensure_deployed().await?;
                self.manager.get_results(id).await
            }
            tools::STOP_GADGET => {
                let id = required_id(&arguments)?;
                self.oracle.ensure_deployed().await?;
                self.manager
                    .stop_gadget(id)
                    .await
                    .map(|()| format!("Gadget with ID {id} stopped successfully"))
            }
            tools::LIST_GADGETS => self.list_gadgets(&arguments).await,
            tools::DEPLOY => {
                let chart_version = arguments.get("chart_version").and_then(Value::as_str);
                self.deployer()?.deploy(chart_version).await
            }
            tools::UNDEPLOY => self.deployer()?.undeploy().await,
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };
        Ok(outcome?)
    }

    async fn observe(&self, kind: ProbeKind, mut arguments: RequestParams) -> Result<String, GadgetError> {
        let duration = requested_duration(&arguments);
        let window = observation_window(duration)?;
        self.oracle.ensure_deployed().await?;

        arguments.insert("duration".into(), json!(duration));
        let runtime_params = params::translate(kind, &arguments);
        let image = kind.image(&self.image_tag);
        debug!(probe = %kind, ?runtime_params, "translated tool arguments");

        if duration == 0.0 {
            let tags = [format!("{TOOL_NAME_TAG}={}", kind.tool_name())];
            let id = self.manager.start_gadget(&image, runtime_params, &tags).await?;
            return Ok(format!("Gadget started with ID: {id}"));
        }
        self.manager.run_gadget(&image, runtime_params, window).await
    }

    async fn list_gadgets(&self, arguments: &RequestParams) -> Result<String, GadgetError> {
        let tags: Vec<String> = arguments
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        self.oracle.ensure_deployed().await?;
        let instances = self.manager.list_gadgets(&tags).await?;
        Ok(serde_json::to_string(&instances)?)
    }

    fn deployer(&self) -> Result<&ChartDeployer, ToolError> {
        self.deployer
            .as_deref()
            .ok_or_else(|| ToolError::UnknownTool(tools::DEPLOY.to_string()))
    }
}

/// Seconds to observe. Anything other than a finite, non-negative number
/// falls back to the default.
fn requested_duration(arguments: &RequestParams) -> f64 {
    arguments
        .get("duration")
        .and_then(Value::as_f64)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .unwrap_or(DEFAULT_DURATION_SECS)
}

fn observation_window(secs: f64) -> Result<Duration, GadgetError> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|window| window.as_secs_f64() <= MAX_DURATION_SECS)
        .ok_or_else(|| {
            GadgetError::InvalidDuration(format!("must be at most {MAX_DURATION_SECS} seconds"))
        })
}

fn required_id(arguments: &RequestParams) -> Result<&str, GadgetError> {
    match arguments.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(GadgetError::MissingParameter("id")),
    }
}
