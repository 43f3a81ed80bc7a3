//! Planegate agent binary

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use planegate_agent::kube_client::{InClusterClientProvider, KubeClientProvider};
use planegate_agent::resources::KubeResources;
use planegate_agent::{
    AgentClient, AgentConfig, Cli, ClusterAgentHandler, HttpTunnelHandler, KubernetesExecutor,
    RequestHandler, Router,
};
use planegate_common::telemetry::{init_telemetry, TelemetryConfig};
use planegate_proto::ProtocolVersion;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The agent cannot dial the gateway without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        service_name: "planegate-agent".to_string(),
        log_level: cli.log_level.clone(),
    })?;

    let config = cli.into_config()?;
    let conn = InClusterClientProvider
        .create()
        .await
        .context("failed to create Kubernetes client")?;
    info!(endpoint = %conn.endpoint, "kubernetes client ready");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    match config.protocol {
        ProtocolVersion::ClusterAgent => {
            let resources = Arc::new(KubeResources::new(conn.client.clone()));
            let handler = ClusterAgentHandler::new(KubernetesExecutor::new(resources));
            serve(config, handler, cancel).await
        }
        ProtocolVersion::HttpTunnel => {
            let routes = config.routes.clone();
            let router = Router::new(&conn, routes).context("invalid route configuration")?;
            info!(targets = ?router.targets(), "router ready");
            let handler = HttpTunnelHandler::new(Arc::new(router));
            serve(config, handler, cancel).await
        }
    }
}

async fn serve<H: RequestHandler>(
    config: AgentConfig,
    handler: H,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let client = AgentClient::new(config, Arc::new(handler))?;
    client.run(cancel).await;
    Ok(())
}
