use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gadget_mcp::cluster::KubectlClient;
use gadget_mcp::command::{CommandRunner, ShellProcess};
use gadget_mcp::config::AppConfig;
use gadget_mcp::gadget::{ChartDeployer, DeploymentOracle, GadgetManager};
use gadget_mcp::mcp::handlers::GadgetTools;
use gadget_mcp::mcp::{AccessLevel, McpConfig, McpServer, Transport, default_socket_path};
use gadget_mcp::telemetry::logging::{self, LogConfig, LogLevel};
use gadget_runtime::{Endpoint, Environment, RpcRuntime};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gadget-mcp", version, about = "MCP server for Inspektor Gadget")]
struct Cli {
    #[arg(long, value_enum, help = "Serve MCP over stdio or a unix socket")]
    transport: Option<Transport>,

    #[arg(long, help = "Unix socket path when --transport socket is used")]
    socket: Option<PathBuf>,

    #[arg(long, value_enum, help = "Highest class of tools exposed to callers")]
    access_level: Option<AccessLevel>,

    #[arg(long, help = "Gadget runtime endpoint, unix:///path or tcp://host:port")]
    runtime_endpoint: Option<String>,

    #[arg(long, help = "Path to the kubeconfig used by kubectl and helm")]
    kubeconfig: Option<String>,

    #[arg(long, help = "Kubeconfig context to use")]
    context: Option<String>,

    #[arg(long, value_enum, env = "GADGET_MCP_LOG_LEVEL", default_value = "warn")]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(socket) = &self.socket {
            config.socket_path = Some(socket.display().to_string());
        }
        if let Some(access_level) = self.access_level {
            config.access_level = access_level;
        }
        if let Some(endpoint) = &self.runtime_endpoint {
            config.runtime_endpoint = endpoint.clone();
        }
        if self.kubeconfig.is_some() {
            config.kubeconfig = self.kubeconfig.clone();
        }
        if self.context.is_some() {
            config.kube_context = self.context.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut cfg = AppConfig::from_env().context("read GADGET_MCP_* configuration")?;
    cli.apply(&mut cfg);

    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli
            .log_file
            .clone()
            .or_else(|| cfg.log_path.as_ref().map(PathBuf::from)),
    })
    .context("initialize logging")?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellProcess::new(cfg.command_timeout()));
    let cluster = KubectlClient::new(Arc::clone(&runner))
        .with_kubeconfig(cfg.kubeconfig.clone())
        .with_context(cfg.kube_context.clone());
    let oracle = Arc::new(DeploymentOracle::new(Arc::new(cluster)));

    let endpoint = Endpoint::parse(&cfg.runtime_endpoint);
    info!(%endpoint, "using gadget runtime");
    let runtime = Arc::new(RpcRuntime::new(endpoint, Environment::Kubernetes));
    let manager = Arc::new(GadgetManager::new(runtime));

    let mut tools = GadgetTools::new(
        Arc::clone(&manager),
        Arc::clone(&oracle),
        cfg.image_tag.clone(),
        cfg.access_level,
    );
    if cfg.access_level.can_modify_cluster() {
        let deployer = ChartDeployer::new(
            Arc::clone(&runner),
            Arc::clone(&oracle),
            cfg.namespace_policy(),
            cfg.chart_version.clone(),
        )
        .with_kube_target(cfg.kubeconfig.clone(), cfg.kube_context.clone());
        tools = tools.with_deployer(Arc::new(deployer));
    }

    let server = McpServer::new(
        McpConfig {
            transport: cfg.transport,
            socket: match cfg.transport {
                Transport::Socket => Some(
                    cfg.socket_path
                        .as_ref()
                        .map(PathBuf::from)
                        .unwrap_or_else(default_socket_path),
                ),
                Transport::Stdio => None,
            },
            access_level: cfg.access_level,
        },
        tools,
    );
    info!(
        transport = ?cfg.transport,
        access_level = cfg.access_level.as_str(),
        "starting gadget MCP server"
    );

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }

    if let Err(err) = manager.close().await {
        warn!(error = %err, "failed to close gadget runtime");
    }
    Ok(())
}
