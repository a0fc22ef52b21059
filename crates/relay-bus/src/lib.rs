use std::collections::HashMap;

use harbor_proto::{
    ControllerStatus, EndpointId, EndpointStatus, Envelope, RawEnvelope, Role, TargetStatus,
};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub const DEFAULT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub role: Role,
    pub id: EndpointId,
}

impl Endpoint {
    pub fn new(role: Role, id: impl Into<EndpointId>) -> Self {
        Self {
            role,
            id: id.into(),
        }
    }
}

/// Handed to the connection glue when an endpoint joins; envelopes routed to
/// the endpoint arrive on `receiver` in the order they were forwarded.
#[derive(Debug)]
pub struct Attachment {
    pub endpoint: Endpoint,
    pub receiver: mpsc::Receiver<RawEnvelope>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BusSnapshot {
    pub controllers: Vec<EndpointId>,
    pub targets: Vec<EndpointId>,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("{role} '{id}' is already connected")]
    DuplicateEndpoint { role: Role, id: EndpointId },
    #[error("{role} '{id}' is not connected")]
    NotAttached { role: Role, id: EndpointId },
}

pub type BusResult<T> = Result<T, BusError>;

/// Role-addressed envelope router.
///
/// Envelopes always cross to the other role: controllers reach targets and
/// targets reach controllers. A named recipient turns the fan-out into a
/// unicast. Delivery never blocks; a missing or saturated recipient means
/// the envelope is dropped.
pub trait Bus: Send + Sync {
    fn attach(&self, role: Role, id: EndpointId) -> BusResult<Attachment>;
    fn detach(&self, endpoint: &Endpoint);
    fn forward(&self, from: &Endpoint, envelope: RawEnvelope) -> BusResult<Delivery>;
    fn snapshot(&self) -> BusSnapshot;
}

/// In-memory bus used by the relay server and by tests.
#[derive(Debug)]
pub struct LocalBus {
    channel_depth: usize,
    endpoints: RwLock<HashMap<Role, HashMap<EndpointId, mpsc::Sender<RawEnvelope>>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_DEPTH)
    }
}

impl LocalBus {
    pub fn new(channel_depth: usize) -> Self {
        Self {
            channel_depth: channel_depth.max(1),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    fn status_envelope(endpoint: &Endpoint, status: EndpointStatus) -> Option<RawEnvelope> {
        let envelope = match endpoint.role {
            Role::Controller => Envelope::ControllerStatus(ControllerStatus {
                controller_id: endpoint.id.clone(),
                status,
            }),
            Role::Target => Envelope::TargetStatus(TargetStatus {
                target_id: endpoint.id.clone(),
                status,
            }),
        };
        match RawEnvelope::from_envelope(&envelope) {
            Ok(raw) => Some(raw),
            Err(err) => {
                warn!(target = "relay::bus", error = %err, "failed to encode status envelope");
                None
            }
        }
    }

    /// Push `envelope` to `recipients` of `role`. Endpoints stay registered
    /// until `detach`, even once their receiver is gone, so every departure
    /// is announced exactly once.
    fn deliver(
        &self,
        role: Role,
        recipients: Option<&str>,
        envelope: &RawEnvelope,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        let guard = self.endpoints.read();
        let targets: Vec<(&EndpointId, &mpsc::Sender<RawEnvelope>)> =
            match (guard.get(&role), recipients) {
                (Some(peers), Some(id)) => peers.get_key_value(id).into_iter().collect(),
                (Some(peers), None) => peers.iter().collect(),
                (None, _) => Vec::new(),
            };
        if targets.is_empty() {
            debug!(
                target = "relay::bus",
                role = %role,
                recipient = ?recipients,
                kind = envelope.kind(),
                "no recipient connected; dropping envelope"
            );
            delivery.dropped += 1;
            return delivery;
        }
        for (id, sender) in targets {
            match sender.try_send(envelope.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        target = "relay::bus",
                        role = %role,
                        endpoint = %id,
                        "recipient buffer full; dropping envelope"
                    );
                    delivery.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        target = "relay::bus",
                        role = %role,
                        endpoint = %id,
                        "recipient is closing; dropping envelope"
                    );
                    delivery.dropped += 1;
                }
            }
        }
        delivery
    }
}

impl Bus for LocalBus {
    fn attach(&self, role: Role, id: EndpointId) -> BusResult<Attachment> {
        let (tx, rx) = mpsc::channel(self.channel_depth);
        let endpoint = Endpoint::new(role, id);
        let existing_peers: Vec<EndpointId> = {
            let mut guard = self.endpoints.write();
            let same_role = guard.entry(role).or_default();
            if same_role.contains_key(&endpoint.id) {
                return Err(BusError::DuplicateEndpoint {
                    role,
                    id: endpoint.id,
                });
            }
            same_role.insert(endpoint.id.clone(), tx.clone());
            guard
                .get(&role.peer())
                .map(|peers| peers.keys().cloned().collect())
                .unwrap_or_default()
        };

        // Let the newcomer discover who is already on the other side.
        for peer_id in existing_peers {
            let peer = Endpoint::new(role.peer(), peer_id);
            if let Some(status) = Self::status_envelope(&peer, EndpointStatus::Connected) {
                if let Err(err) = tx.try_send(status) {
                    debug!(
                        target = "relay::bus",
                        role = %role,
                        endpoint = %endpoint.id,
                        peer = %peer.id,
                        error = %err,
                        "failed to queue discovery status"
                    );
                }
            }
        }
        if let Some(status) = Self::status_envelope(&endpoint, EndpointStatus::Connected) {
            self.deliver(role.peer(), None, &status);
        }

        debug!(target = "relay::bus", role = %role, endpoint = %endpoint.id, "endpoint attached");
        Ok(Attachment {
            endpoint,
            receiver: rx,
        })
    }

    fn detach(&self, endpoint: &Endpoint) {
        let removed = {
            let mut guard = self.endpoints.write();
            guard
                .get_mut(&endpoint.role)
                .and_then(|peers| peers.remove(&endpoint.id))
                .is_some()
        };
        if !removed {
            return;
        }
        if let Some(status) = Self::status_envelope(endpoint, EndpointStatus::Disconnected) {
            self.deliver(endpoint.role.peer(), None, &status);
        }
        debug!(
            target = "relay::bus",
            role = %endpoint.role,
            endpoint = %endpoint.id,
            "endpoint detached"
        );
    }

    fn forward(&self, from: &Endpoint, mut envelope: RawEnvelope) -> BusResult<Delivery> {
        let attached = self
            .endpoints
            .read()
            .get(&from.role)
            .map(|peers| peers.contains_key(&from.id))
            .unwrap_or(false);
        if !attached {
            return Err(BusError::NotAttached {
                role: from.role,
                id: from.id.clone(),
            });
        }

        if from.role == Role::Controller {
            envelope.stamp_controller(&from.id);
        }
        let recipient = envelope.recipient(from.role).map(str::to_string);
        Ok(self.deliver(from.role.peer(), recipient.as_deref(), &envelope))
    }

    fn snapshot(&self) -> BusSnapshot {
        let guard = self.endpoints.read();
        let ids = |role: Role| {
            let mut ids: Vec<EndpointId> = guard
                .get(&role)
                .map(|peers| peers.keys().cloned().collect())
                .unwrap_or_default();
            ids.sort();
            ids
        };
        BusSnapshot {
            controllers: ids(Role::Controller),
            targets: ids(Role::Target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_proto::{CommandEnvelope, Envelope};

    fn command(request_id: u64) -> RawEnvelope {
        RawEnvelope::from_envelope(&Envelope::Command(CommandEnvelope::new("camera", request_id)))
            .expect("raw command")
    }

    fn drain(rx: &mut mpsc::Receiver<RawEnvelope>) -> Vec<RawEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[test_timeout::tokio_timeout_test]
    async fn controller_commands_reach_targets_with_stamped_id() {
        let bus = LocalBus::default();
        let mut target = bus.attach(Role::Target, "tgt".into()).expect("attach target");
        let controller = bus.attach(Role::Controller, "ctl".into()).expect("attach ctl");
        drain(&mut target.receiver);

        let delivery = bus.forward(&controller.endpoint, command(1)).expect("forward");
        assert_eq!(delivery, Delivery { delivered: 1, dropped: 0 });

        let received = target.receiver.recv().await.expect("command");
        assert_eq!(received.kind(), "command");
        assert_eq!(received.recipient(Role::Target), Some("ctl"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn status_envelopes_announce_both_directions() {
        let bus = LocalBus::default();
        let mut target = bus.attach(Role::Target, "tgt".into()).expect("attach target");
        let mut controller = bus.attach(Role::Controller, "ctl".into()).expect("attach ctl");

        let announced = target.receiver.recv().await.expect("controller status");
        assert_eq!(announced.kind(), "controller-status");
        let discovered = controller.receiver.recv().await.expect("target status");
        assert_eq!(discovered.kind(), "target-status");

        bus.detach(&controller.endpoint);
        let gone = target.receiver.recv().await.expect("disconnect status");
        assert_eq!(
            gone.into_envelope().expect("typed"),
            Envelope::ControllerStatus(ControllerStatus {
                controller_id: "ctl".into(),
                status: EndpointStatus::Disconnected,
            })
        );
    }

    #[test_timeout::timeout]
    fn responses_unicast_to_named_controller() {
        let bus = LocalBus::default();
        let target = bus.attach(Role::Target, "tgt".into()).expect("attach target");
        let mut alice = bus.attach(Role::Controller, "alice".into()).expect("attach");
        let mut bob = bus.attach(Role::Controller, "bob".into()).expect("attach");
        drain(&mut alice.receiver);
        drain(&mut bob.receiver);

        let response = RawEnvelope::parse(r#"{"type":"response","controllerId":"bob","requestId":4}"#)
            .expect("parse");
        let delivery = bus.forward(&target.endpoint, response).expect("forward");
        assert_eq!(delivery.delivered, 1);
        assert!(drain(&mut alice.receiver).is_empty());
        assert_eq!(drain(&mut bob.receiver).len(), 1);
    }

    #[test_timeout::timeout]
    fn absent_recipient_drops_instead_of_queueing() {
        let bus = LocalBus::default();
        let target = bus.attach(Role::Target, "tgt".into()).expect("attach target");
        let response = RawEnvelope::parse(r#"{"type":"response","controllerId":"gone"}"#)
            .expect("parse");
        let delivery = bus.forward(&target.endpoint, response).expect("forward");
        assert_eq!(delivery, Delivery { delivered: 0, dropped: 1 });

        let mut late = bus.attach(Role::Controller, "gone".into()).expect("attach");
        let backlog = drain(&mut late.receiver);
        assert!(backlog.iter().all(|envelope| envelope.kind() == "target-status"));
    }

    #[test_timeout::timeout]
    fn saturated_recipient_drops_without_blocking() {
        let bus = LocalBus::new(1);
        let _target = bus.attach(Role::Target, "tgt".into()).expect("attach target");
        let controller = bus.attach(Role::Controller, "ctl".into()).expect("attach ctl");
        // The target's single slot is taken by the controller-status announcement.
        let delivery = bus.forward(&controller.endpoint, command(1)).expect("forward");
        assert_eq!(delivery, Delivery { delivered: 0, dropped: 1 });
    }

    #[test_timeout::timeout]
    fn per_sender_order_is_preserved() {
        let bus = LocalBus::default();
        let mut target = bus.attach(Role::Target, "tgt".into()).expect("attach target");
        let controller = bus.attach(Role::Controller, "ctl".into()).expect("attach ctl");
        drain(&mut target.receiver);
        for request_id in 1..=10 {
            bus.forward(&controller.endpoint, command(request_id)).expect("forward");
        }
        let ids: Vec<u64> = drain(&mut target.receiver)
            .iter()
            .filter_map(|envelope| envelope.get("requestId").and_then(|v| v.as_u64()))
            .collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[test_timeout::timeout]
    fn duplicate_ids_are_refused_per_role() {
        let bus = LocalBus::default();
        let _first = bus.attach(Role::Target, "same".into()).expect("attach");
        assert!(matches!(
            bus.attach(Role::Target, "same".into()),
            Err(BusError::DuplicateEndpoint { .. })
        ));
        // The same id on the other side is a different endpoint.
        assert!(bus.attach(Role::Controller, "same".into()).is_ok());
        assert_eq!(
            bus.snapshot(),
            BusSnapshot {
                controllers: vec!["same".into()],
                targets: vec!["same".into()],
            }
        );
    }

    #[test_timeout::timeout]
    fn detached_senders_cannot_forward() {
        let bus = LocalBus::default();
        let controller = bus.attach(Role::Controller, "ctl".into()).expect("attach");
        bus.detach(&controller.endpoint);
        assert!(matches!(
            bus.forward(&controller.endpoint, command(1)),
            Err(BusError::NotAttached { .. })
        ));
    }

    #[test_timeout::timeout]
    fn closed_receiver_is_still_announced_on_detach() {
        let bus = LocalBus::default();
        let mut target = bus.attach(Role::Target, "tgt".into()).expect("attach target");
        let controller = bus.attach(Role::Controller, "ctl".into()).expect("attach ctl");
        let Attachment { endpoint, receiver } = controller;
        drop(receiver);
        drain(&mut target.receiver);

        let response = RawEnvelope::parse(r#"{"type":"response","controllerId":"ctl","requestId":1}"#)
            .expect("parse");
        let delivery = bus.forward(&target.endpoint, response).expect("forward");
        assert_eq!(delivery, Delivery { delivered: 0, dropped: 1 });
        assert_eq!(bus.snapshot().controllers, vec!["ctl".to_string()]);

        bus.detach(&endpoint);
        let received: Vec<Envelope> = drain(&mut target.receiver)
            .into_iter()
            .map(|raw| raw.into_envelope().expect("typed"))
            .collect();
        assert_eq!(
            received,
            vec![Envelope::ControllerStatus(ControllerStatus {
                controller_id: "ctl".into(),
                status: EndpointStatus::Disconnected,
            })]
        );
        assert!(bus.snapshot().controllers.is_empty());
    }
}
