use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use harbor_proto::{generate_endpoint_id, EndpointId, RawEnvelope, Role};
use relay_bus::{Attachment, BusError, Endpoint};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::RelayState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub role: Option<String>,
    pub id: Option<String>,
}

/// Upgrade `/ws?role=&id=`; a missing id gets a generated one.
pub async fn websocket_handler(
    State(state): State<RelayState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let role = match query.role.as_deref().map(str::parse::<Role>) {
        Some(Ok(role)) => role,
        Some(Err(err)) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        None => return (StatusCode::BAD_REQUEST, "missing 'role' query parameter").into_response(),
    };
    let id = match query.id {
        Some(id) if !id.trim().is_empty() => id,
        _ => generate_endpoint_id(),
    };
    if state.is_connected(role, &id) {
        warn!(role = %role, endpoint = %id, "refusing duplicate endpoint id");
        return (StatusCode::CONFLICT, format!("{role} '{id}' is already connected"))
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, role, id))
}

async fn handle_socket(socket: WebSocket, state: RelayState, role: Role, id: EndpointId) {
    let Attachment {
        endpoint,
        mut receiver,
    } = match state.bus().attach(role, id) {
        Ok(attachment) => attachment,
        Err(err @ BusError::DuplicateEndpoint { .. }) => {
            // Lost a race with another upgrade for the same id.
            warn!(error = %err, "closing duplicate connection");
            let _ = socket.close().await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to attach endpoint");
            let _ = socket.close().await;
            return;
        }
    };
    state.on_connected(&endpoint);
    info!(role = %endpoint.role, endpoint = %endpoint.id, "endpoint connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();

    let writer_endpoint = endpoint.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(envelope) = receiver.recv() => Message::Text(envelope.to_text()),
                Some(message) = control_rx.recv() => message,
                else => break,
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        debug!(
            role = %writer_endpoint.role,
            endpoint = %writer_endpoint.id,
            "writer task finished"
        );
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => relay_frame(&state, &endpoint, &text, &control_tx),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => relay_frame(&state, &endpoint, text, &control_tx),
                Err(_) => reject(&state, &endpoint, &control_tx, "binary frames must be utf-8 json"),
            },
            Ok(Message::Close(frame)) => {
                info!(
                    role = %endpoint.role,
                    endpoint = %endpoint.id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "endpoint closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    role = %endpoint.role,
                    endpoint = %endpoint.id,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        }
    }

    state.bus().detach(&endpoint);
    state.on_disconnected(&endpoint);
    writer.abort();
    info!(role = %endpoint.role, endpoint = %endpoint.id, "endpoint disconnected");
}

fn relay_frame(
    state: &RelayState,
    from: &Endpoint,
    text: &str,
    control: &mpsc::UnboundedSender<Message>,
) {
    let envelope = match RawEnvelope::parse(text) {
        Ok(envelope) => envelope,
        Err(err) => return reject(state, from, control, &err.to_string()),
    };
    let kind = envelope.kind().to_string();
    match state.bus().forward(from, envelope) {
        Ok(delivery) => {
            debug!(
                role = %from.role,
                endpoint = %from.id,
                kind = %kind,
                delivered = delivery.delivered,
                dropped = delivery.dropped,
                "envelope forwarded"
            );
            state.record_forward(from, delivery);
        }
        Err(err) => warn!(
            role = %from.role,
            endpoint = %from.id,
            kind = %kind,
            error = %err,
            "failed to forward envelope"
        ),
    }
}

fn reject(
    state: &RelayState,
    from: &Endpoint,
    control: &mpsc::UnboundedSender<Message>,
    reason: &str,
) {
    debug!(role = %from.role, endpoint = %from.id, reason, "rejecting frame");
    state.record_rejected(from);
    let _ = control.send(Message::Text(error_frame(reason)));
}

pub fn error_frame(message: &str) -> String {
    json!({ "type": "error", "message": message }).to_string()
}
