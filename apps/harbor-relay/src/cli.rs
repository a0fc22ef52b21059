use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use harbor_proto::{
    endpoint_url, generate_endpoint_id, CommandEnvelope, Envelope, PermissionDecision,
    RawEnvelope, ResponseEnvelope, Role,
};
use serde_json::{Map, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "harbor-relay", author, version)]
#[command(about = "Harbor relay server and controller debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default when no command is given)
    Serve,

    /// Act as a controller: send one command and print what comes back
    Send(SendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the relay listener to.
    #[arg(
        long,
        global = true,
        env = "HARBOR_RELAY_LISTEN_ADDR",
        default_value = "127.0.0.1:3000"
    )]
    pub listen_addr: String,

    /// Per-endpoint outbound buffer; envelopes beyond it are dropped.
    #[arg(
        long,
        global = true,
        env = "HARBOR_RELAY_CHANNEL_DEPTH",
        default_value_t = relay_bus::DEFAULT_CHANNEL_DEPTH
    )]
    pub channel_depth: usize,

    /// Grace period applied during shutdown.
    #[arg(
        long,
        global = true,
        env = "HARBOR_RELAY_SHUTDOWN_GRACE_SECS",
        default_value_t = 1
    )]
    pub shutdown_grace_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Relay URL (e.g., ws://localhost:3000)
    #[arg(short, long, env = "HARBOR_RELAY_URL", default_value = "ws://127.0.0.1:3000")]
    pub url: String,

    /// Unicast to this target instead of every connected target
    #[arg(short, long)]
    pub target: Option<String>,

    /// Controller id to connect as (generated when omitted)
    #[arg(long)]
    pub controller_id: Option<String>,

    /// Request id placed on the command
    #[arg(long, default_value_t = 1)]
    pub request_id: u64,

    /// Seconds to wait for the response; cover the target's decision timeout
    #[arg(long, default_value_t = 35)]
    pub wait_secs: u64,

    /// Command name (camera, files, sms, flashlight, location, ...)
    pub command: String,

    /// Arguments as key=value; values that parse as JSON are sent as JSON
    pub args: Vec<String>,
}

/// Everything the relay delivered for one command.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub controller_id: String,
    pub decision: Option<PermissionDecision>,
    pub response: ResponseEnvelope,
}

pub fn parse_command_args(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut args = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("argument '{pair}' must be key=value");
        };
        if key.is_empty() {
            bail!("argument '{pair}' has an empty key");
        }
        let value =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        args.insert(key.to_string(), value);
    }
    Ok(args)
}

pub async fn send_command(args: &SendArgs) -> Result<SendReport> {
    let controller_id = args
        .controller_id
        .clone()
        .unwrap_or_else(|| format!("controller-{}", generate_endpoint_id()));
    let url = endpoint_url(&args.url, Role::Controller, &controller_id)?;
    debug!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let mut command = CommandEnvelope::new(&args.command, args.request_id);
    command.args = parse_command_args(&args.args)?;
    if let Some(target) = &args.target {
        command = command.to_target(target);
    }
    let text = Envelope::Command(command).to_json()?;
    write.send(Message::Text(text)).await?;

    let request_id = args.request_id;
    let wait = async {
        let mut decision = None;
        while let Some(msg) = read.next().await {
            let Message::Text(text) = msg? else {
                continue;
            };
            match Envelope::from_json(&text) {
                Ok(Envelope::PermissionResponse(received)) if received.request_id == request_id => {
                    decision = Some(received);
                }
                Ok(Envelope::Response(response)) if response.request_id == request_id => {
                    return Ok::<_, anyhow::Error>((decision, response));
                }
                Ok(other) => debug!(kind = other.type_name(), "ignoring unrelated envelope"),
                Err(_) => {
                    let raw = RawEnvelope::parse(&text).context("relay sent a malformed frame")?;
                    if raw.kind() == "error" {
                        bail!("relay rejected the command: {:?}", raw.get("message"));
                    }
                    debug!(kind = raw.kind(), "ignoring unrecognised envelope");
                }
            }
        }
        Err(anyhow!("Relay closed the connection before a response arrived"))
    };

    let (decision, response) = match timeout(Duration::from_secs(args.wait_secs), wait).await {
        Ok(result) => result?,
        Err(_) => bail!("No response within {} seconds", args.wait_secs),
    };
    let _ = write.close().await;
    Ok(SendReport {
        controller_id,
        decision,
        response,
    })
}

pub async fn run_send_client(args: SendArgs) -> Result<()> {
    let report = send_command(&args).await?;
    println!("controller: {}", report.controller_id);
    if let Some(decision) = &report.decision {
        println!("permission: {}", serde_json::to_string_pretty(decision)?);
    }
    println!("response: {}", serde_json::to_string_pretty(&report.response)?);
    Ok(())
}
