use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use harbor_proto::{EndpointId, Role};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_bus::{Bus, Delivery, Endpoint, LocalBus};
use serde::Serialize;

pub const METRIC_CONNECTIONS_TOTAL: &str = "harbor_relay_connections_total";
pub const METRIC_FORWARDED_TOTAL: &str = "harbor_relay_envelopes_forwarded_total";
pub const METRIC_DROPPED_TOTAL: &str = "harbor_relay_envelopes_dropped_total";
pub const METRIC_REJECTED_TOTAL: &str = "harbor_relay_frames_rejected_total";
pub const METRIC_ENDPOINTS_ACTIVE: &str = "harbor_relay_endpoints_active";

#[derive(Debug)]
struct ConnectionEntry {
    connected_at: Instant,
    envelopes_sent: u64,
    envelopes_dropped: u64,
}

/// Shared state behind every route: the bus plus per-connection counters.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    bus: Arc<dyn Bus>,
    connections: DashMap<Endpoint, ConnectionEntry>,
    metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub controllers: usize,
    pub targets: usize,
    pub controller_ids: Vec<EndpointId>,
    pub target_ids: Vec<EndpointId>,
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionSummary {
    pub role: Role,
    pub id: EndpointId,
    pub connected_secs: u64,
    pub envelopes_sent: u64,
    pub envelopes_dropped: u64,
}

impl RelayState {
    pub fn new(bus: Arc<dyn Bus>, metrics: PrometheusHandle) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                bus,
                connections: DashMap::new(),
                metrics,
            }),
        }
    }

    pub fn with_local_bus(channel_depth: usize, metrics: PrometheusHandle) -> Self {
        Self::new(Arc::new(LocalBus::new(channel_depth)), metrics)
    }

    pub fn bus(&self) -> &dyn Bus {
        self.inner.bus.as_ref()
    }

    pub fn is_connected(&self, role: Role, id: &str) -> bool {
        self.inner
            .connections
            .contains_key(&Endpoint::new(role, id.to_string()))
    }

    pub fn on_connected(&self, endpoint: &Endpoint) {
        self.inner.connections.insert(
            endpoint.clone(),
            ConnectionEntry {
                connected_at: Instant::now(),
                envelopes_sent: 0,
                envelopes_dropped: 0,
            },
        );
        counter!(METRIC_CONNECTIONS_TOTAL, 1, "role" => endpoint.role.as_str());
        self.publish_active(endpoint.role);
    }

    pub fn on_disconnected(&self, endpoint: &Endpoint) {
        self.inner.connections.remove(endpoint);
        self.publish_active(endpoint.role);
    }

    pub fn record_forward(&self, from: &Endpoint, delivery: Delivery) {
        if let Some(mut entry) = self.inner.connections.get_mut(from) {
            entry.envelopes_sent += 1;
            entry.envelopes_dropped += delivery.dropped as u64;
        }
        if delivery.delivered > 0 {
            counter!(
                METRIC_FORWARDED_TOTAL,
                delivery.delivered as u64,
                "from" => from.role.as_str()
            );
        }
        if delivery.dropped > 0 {
            counter!(
                METRIC_DROPPED_TOTAL,
                delivery.dropped as u64,
                "from" => from.role.as_str()
            );
        }
    }

    pub fn record_rejected(&self, from: &Endpoint) {
        counter!(METRIC_REJECTED_TOTAL, 1, "from" => from.role.as_str());
    }

    pub fn stats(&self) -> StatsResponse {
        let snapshot = self.bus().snapshot();
        let mut connections: Vec<ConnectionSummary> = self
            .inner
            .connections
            .iter()
            .map(|entry| ConnectionSummary {
                role: entry.key().role,
                id: entry.key().id.clone(),
                connected_secs: entry.connected_at.elapsed().as_secs(),
                envelopes_sent: entry.envelopes_sent,
                envelopes_dropped: entry.envelopes_dropped,
            })
            .collect();
        connections.sort_by(|a, b| (a.role.as_str(), &a.id).cmp(&(b.role.as_str(), &b.id)));
        StatsResponse {
            controllers: snapshot.controllers.len(),
            targets: snapshot.targets.len(),
            controller_ids: snapshot.controllers,
            target_ids: snapshot.targets,
            connections,
        }
    }

    pub fn render_metrics(&self) -> String {
        self.inner.metrics.render()
    }

    fn publish_active(&self, role: Role) {
        let active = self
            .inner
            .connections
            .iter()
            .filter(|entry| entry.key().role == role)
            .count();
        gauge!(METRIC_ENDPOINTS_ACTIVE, active as f64, "role" => role.as_str());
    }
}
