use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use harbor_proto::{endpoint_url, generate_endpoint_id, Role};

use crate::authorization::AuthorizerKind;

#[derive(Debug, Parser)]
#[command(
    name = "harbor-target",
    author,
    version,
    about = "Permission-gated command target for the harbor relay"
)]
pub struct Cli {
    /// Base URL of the relay (ws, wss, http or https).
    #[arg(long, env = "HARBOR_TARGET_RELAY_URL", default_value = "ws://127.0.0.1:3000")]
    pub relay_url: String,

    /// Identity to register under; a random id is generated when omitted.
    #[arg(long, env = "HARBOR_TARGET_ID")]
    pub target_id: Option<String>,

    /// How permission prompts are answered.
    #[arg(
        long,
        env = "HARBOR_TARGET_AUTHORIZER",
        value_enum,
        default_value = "interactive"
    )]
    pub authorizer: AuthorizerKind,

    /// Seconds to wait for a permission decision before treating it as a denial.
    #[arg(long, env = "HARBOR_TARGET_DECISION_TIMEOUT_SECS", default_value_t = 30)]
    pub decision_timeout_secs: u64,

    /// Seconds between reconnect attempts after the relay connection drops.
    #[arg(long, env = "HARBOR_TARGET_RECONNECT_DELAY_SECS", default_value_t = 5)]
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub relay_url: String,
    pub target_id: String,
    pub authorizer: AuthorizerKind,
    pub decision_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:3000".to_string(),
            target_id: format!("target-{}", generate_endpoint_id()),
            authorizer: AuthorizerKind::Interactive,
            decision_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl TryFrom<Cli> for TargetConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.decision_timeout_secs == 0 {
            bail!("decision timeout must be at least one second");
        }
        let target_id = match cli.target_id {
            Some(id) if id.trim().is_empty() => bail!("target id must not be empty"),
            Some(id) => id,
            None => format!("target-{}", generate_endpoint_id()),
        };
        // Validate up front so a bad URL fails at startup, not on every reconnect.
        endpoint_url(&cli.relay_url, Role::Target, &target_id)
            .with_context(|| format!("invalid relay url: {}", cli.relay_url))?;
        Ok(TargetConfig {
            relay_url: cli.relay_url,
            target_id,
            authorizer: cli.authorizer,
            decision_timeout: Duration::from_secs(cli.decision_timeout_secs),
            reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
        })
    }
}
