//! Planegate gateway binary

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use planegate_common::telemetry::{init_telemetry, TelemetryConfig};
use planegate_gateway::server::spawn_stale_sweeper;
use planegate_gateway::{serve, Cli, GatewayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The gateway cannot accept agent connections without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        service_name: "planegate-gateway".to_string(),
        log_level: cli.log_level.clone(),
    })?;

    let config = cli.into_config()?;
    info!(
        protocol = %config.protocol,
        dispatch_policy = %config.dispatch_policy,
        heartbeat_interval = ?config.heartbeat_interval,
        heartbeat_timeout = ?config.heartbeat_timeout,
        request_timeout = ?config.request_timeout,
        "gateway configured"
    );

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

    let state = GatewayState::new(config);
    let sweeper = spawn_stale_sweeper(
        state.registry.clone(),
        state.config.heartbeat_interval,
        state.config.heartbeat_timeout,
        cancel.clone(),
    );

    let result = serve(state, cancel.clone()).await;
    cancel.cancel();
    let _ = sweeper.await;
    result?;
    info!("gateway stopped");
    Ok(())
}
