use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use relay_bus::DEFAULT_CHANNEL_DEPTH;

use crate::cli::ServeArgs;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub channel_depth: usize,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            channel_depth: DEFAULT_CHANNEL_DEPTH,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.channel_depth == 0 {
            bail!("channel depth must be at least 1");
        }
        Ok(RelayConfig {
            listen_addr,
            channel_depth: args.channel_depth,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    #[test_timeout::timeout]
    fn serve_args_convert() {
        let cli = Cli::try_parse_from([
            "harbor-relay",
            "--listen-addr",
            "0.0.0.0:8080",
            "--channel-depth",
            "16",
        ])
        .expect("parse");
        let config = RelayConfig::try_from(cli.serve).expect("config");
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.channel_depth, 16);
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_addr_and_zero_depth() {
        let cli = Cli::try_parse_from(["harbor-relay", "--listen-addr", "nowhere"]).expect("parse");
        assert!(RelayConfig::try_from(cli.serve).is_err());

        let cli = Cli::try_parse_from(["harbor-relay", "--channel-depth", "0"]).expect("parse");
        assert!(RelayConfig::try_from(cli.serve).is_err());
    }
}
