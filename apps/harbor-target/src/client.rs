use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use harbor_proto::{endpoint_url, EndpointUrlError, Envelope, RawEnvelope, Role};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::actor::{spawn_session, SessionHandle, SessionOptions};
use crate::authorization::Authorize;
use crate::config::TargetConfig;
use crate::dispatcher::CommandDispatcher;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Url(#[from] EndpointUrlError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),
}

/// Everything a target needs to serve connections; shared across reconnects.
#[derive(Clone)]
pub struct TargetAgent {
    config: TargetConfig,
    dispatcher: Arc<CommandDispatcher>,
    authorizer: Arc<dyn Authorize>,
}

impl TargetAgent {
    pub fn new(
        config: TargetConfig,
        dispatcher: CommandDispatcher,
        authorizer: Arc<dyn Authorize>,
    ) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            authorizer,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.config.target_id
    }

    /// Keep a relay connection alive until the future is dropped.
    ///
    /// Each connection gets a fresh session, so grants never survive a
    /// reconnect. Only an unusable relay URL ends the loop.
    pub async fn run(&self) -> Result<(), ClientError> {
        loop {
            match self.serve_once().await {
                Ok(()) => info!(
                    target_id = %self.config.target_id,
                    "relay connection closed"
                ),
                Err(ClientError::Url(err)) => return Err(ClientError::Url(err)),
                Err(err) => warn!(
                    target_id = %self.config.target_id,
                    error = %err,
                    "relay connection failed"
                ),
            }
            debug!(
                delay_secs = self.config.reconnect_delay.as_secs(),
                "waiting before reconnect"
            );
            sleep(self.config.reconnect_delay).await;
        }
    }

    /// Connect once and serve until the relay closes the socket.
    pub async fn serve_once(&self) -> Result<(), ClientError> {
        let url = endpoint_url(&self.config.relay_url, Role::Target, &self.config.target_id)?;
        let (stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::ConnectTimeout(CONNECT_TIMEOUT)),
        };
        info!(
            target_id = %self.config.target_id,
            relay = %url,
            "connected to relay"
        );

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let session = spawn_session(
            self.config.target_id.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.authorizer),
            outbound_tx,
            SessionOptions {
                decision_timeout: self.config.decision_timeout,
            },
        );

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode outbound envelope");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let mut outcome = Ok(());
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => route_inbound(&session, &text),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => route_inbound(&session, text),
                    Err(_) => debug!(len = bytes.len(), "ignoring non-utf8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    info!(
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "relay closed websocket"
                    );
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    outcome = Err(ClientError::WebSocket(err));
                    break;
                }
            }
        }

        session.shutdown().await;
        let _ = writer.await;
        outcome
    }
}

fn route_inbound(session: &SessionHandle, text: &str) {
    match Envelope::from_json(text) {
        Ok(envelope) => {
            if !session.deliver(envelope) {
                warn!("session stopped; dropping inbound envelope");
            }
        }
        Err(err) => match RawEnvelope::parse(text) {
            Ok(raw) if raw.kind() == "error" => warn!(
                message = ?raw.get("message"),
                "relay rejected a frame"
            ),
            Ok(raw) => debug!(kind = raw.kind(), error = %err, "ignoring unrecognised envelope"),
            Err(raw_err) => warn!(error = %raw_err, "ignoring malformed frame from relay"),
        },
    }
}
