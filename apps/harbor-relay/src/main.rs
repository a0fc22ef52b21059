use anyhow::{Context, Result};
use clap::Parser;
use harbor_relay::{
    cli::{self, Cli, Commands},
    telemetry::{self, Telemetry},
    RelayConfig, RelayState,
};
use tokio::{net::TcpListener, signal};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Send(args)) = cli.command {
        telemetry::init_logging()?;
        return cli::run_send_client(args).await;
    }

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        channel_depth = config.channel_depth,
        "starting harbor relay"
    );

    let state = RelayState::with_local_bus(config.channel_depth, telemetry.metrics_handle());
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    harbor_relay::serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
