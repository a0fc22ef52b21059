use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use harbor_target::{
    handlers::simulated_dispatcher, telemetry, Cli, PromptAuthorizer, TargetAgent, TargetConfig,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let cli = Cli::parse();
    let config = TargetConfig::try_from(cli)?;
    info!(
        target_id = %config.target_id,
        relay_url = %config.relay_url,
        authorizer = ?config.authorizer,
        decision_timeout_secs = config.decision_timeout.as_secs(),
        "starting harbor target"
    );

    let authorizer = PromptAuthorizer::from_kind(config.authorizer);
    if authorizer.is_interactive() {
        info!("permission prompts will be asked on this terminal");
    }
    let agent = TargetAgent::new(config, simulated_dispatcher(), Arc::new(authorizer));

    tokio::select! {
        result = agent.run() => result?,
        _ = signal::ctrl_c() => info!(target_id = %agent.target_id(), "shutdown signal received"),
    }
    Ok(())
}
