use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use harbor_proto::{endpoint_url, ErrorCode, PermissionKind, ResponsePayload, Role};
use harbor_relay::cli::{send_command, SendArgs};
use harbor_relay::RelayState;
use harbor_target::{
    handlers::simulated_dispatcher, AuthorizerKind, PromptAuthorizer, TargetAgent, TargetConfig,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);

struct TestRelay {
    addr: SocketAddr,
    http: reqwest::Client,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay(channel_depth: usize) -> TestRelay {
    let metrics = PrometheusBuilder::new().build_recorder().handle();
    let state = RelayState::with_local_bus(channel_depth, metrics);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        harbor_relay::serve(listener, state, async {
            let _ = shutdown_rx.await;
        })
        .await
        .ok();
    });
    TestRelay {
        addr,
        http: reqwest::Client::new(),
        _shutdown: shutdown_tx,
    }
}

impl TestRelay {
    fn ws_base(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn connect(&self, role: Role, id: &str) -> Ws {
        let url = endpoint_url(&self.ws_base(), role, id).expect("url");
        let (ws, _) = connect_async(url.as_str()).await.expect("connect");
        self.wait_for(role, id, true).await;
        ws
    }

    async fn stats(&self) -> Value {
        self.http
            .get(format!("http://{}/debug/stats", self.addr))
            .send()
            .await
            .expect("stats request")
            .json()
            .await
            .expect("stats json")
    }

    /// Poll until the relay has (or no longer has) the endpoint registered.
    async fn wait_for(&self, role: Role, id: &str, present: bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let stats = self.stats().await;
            let found = stats["connections"]
                .as_array()
                .map(|connections| {
                    connections
                        .iter()
                        .any(|c| c["role"] == role.as_str() && c["id"] == id)
                })
                .unwrap_or(false);
            if found == present {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{role} '{id}' presence never became {present}"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn expect_silence(ws: &mut Ws) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        timeout(Duration::from_millis(200), ws.next()).await
    {
        panic!("unexpected frame: {text}");
    }
}

#[test_timeout::tokio_timeout_test]
async fn health_and_metrics_routes_respond() {
    let relay = start_relay(8).await;
    let health: Value = relay
        .http
        .get(format!("http://{}/healthz", relay.addr))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(health, json!({ "status": "ok" }));

    let metrics = relay
        .http
        .get(format!("http://{}/metrics", relay.addr))
        .send()
        .await
        .expect("metrics");
    assert!(metrics.status().is_success());
    assert_eq!(
        metrics.headers()["content-type"],
        "text/plain; version=0.0.4"
    );

    let stats = relay.stats().await;
    assert_eq!(stats["controllers"], 0);
    assert_eq!(stats["targets"], 0);
}

#[test_timeout::tokio_timeout_test]
async fn status_envelopes_announce_connects_and_disconnects() {
    let relay = start_relay(8).await;
    let mut target = relay.connect(Role::Target, "tgt-1").await;
    let mut controller = relay.connect(Role::Controller, "ctl-1").await;

    let discovered = recv_json(&mut controller).await;
    assert_eq!(
        discovered,
        json!({ "type": "target-status", "targetId": "tgt-1", "status": "connected" })
    );
    let announced = recv_json(&mut target).await;
    assert_eq!(
        announced,
        json!({ "type": "controller-status", "controllerId": "ctl-1", "status": "connected" })
    );

    controller.close(None).await.expect("close");
    let gone = recv_json(&mut target).await;
    assert_eq!(gone["type"], "controller-status");
    assert_eq!(gone["controllerId"], "ctl-1");
    assert_eq!(gone["status"], "disconnected");
}

#[test_timeout::tokio_timeout_test]
async fn controller_commands_fan_out_with_stamped_identity() {
    let relay = start_relay(8).await;
    let mut first = relay.connect(Role::Target, "tgt-1").await;
    let mut second = relay.connect(Role::Target, "tgt-2").await;
    let mut controller = relay.connect(Role::Controller, "ctl-1").await;
    for target in [&mut first, &mut second] {
        assert_eq!(recv_json(target).await["type"], "controller-status");
    }

    send_json(
        &mut controller,
        json!({ "type": "command", "controllerId": "spoofed", "command": "camera", "args": {}, "requestId": 1 }),
    )
    .await;
    for target in [&mut first, &mut second] {
        let command = recv_json(target).await;
        assert_eq!(command["type"], "command");
        assert_eq!(command["controllerId"], "ctl-1");
        assert_eq!(command["requestId"], 1);
    }
}

#[test_timeout::tokio_timeout_test]
async fn target_id_turns_fan_out_into_unicast() {
    let relay = start_relay(8).await;
    let mut first = relay.connect(Role::Target, "tgt-1").await;
    let mut second = relay.connect(Role::Target, "tgt-2").await;
    let mut controller = relay.connect(Role::Controller, "ctl-1").await;
    for target in [&mut first, &mut second] {
        assert_eq!(recv_json(target).await["type"], "controller-status");
    }

    send_json(
        &mut controller,
        json!({ "type": "command", "targetId": "tgt-2", "command": "sms", "requestId": 5 }),
    )
    .await;
    let command = recv_json(&mut second).await;
    assert_eq!(command["requestId"], 5);
    expect_silence(&mut first).await;
}

#[test_timeout::tokio_timeout_test]
async fn responses_reach_only_the_named_controller() {
    let relay = start_relay(8).await;
    let mut target = relay.connect(Role::Target, "tgt-1").await;
    let mut alice = relay.connect(Role::Controller, "alice").await;
    let mut bob = relay.connect(Role::Controller, "bob").await;
    for controller in [&mut alice, &mut bob] {
        assert_eq!(recv_json(controller).await["type"], "target-status");
    }

    send_json(
        &mut target,
        json!({
            "type": "response",
            "controllerId": "bob",
            "command": "files",
            "args": {},
            "response": { "files": [], "path": "/" },
            "requestId": 3
        }),
    )
    .await;
    let response = recv_json(&mut bob).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["requestId"], 3);
    expect_silence(&mut alice).await;
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frames_are_answered_with_an_error_frame() {
    let relay = start_relay(8).await;
    let mut target = relay.connect(Role::Target, "tgt-1").await;
    let mut controller = relay.connect(Role::Controller, "ctl-1").await;
    assert_eq!(recv_json(&mut target).await["type"], "controller-status");
    assert_eq!(recv_json(&mut controller).await["type"], "target-status");

    controller
        .send(Message::Text("not json".into()))
        .await
        .expect("send");
    let error = recv_json(&mut controller).await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().is_some());

    send_json(&mut controller, json!({ "command": "camera", "requestId": 1 })).await;
    assert_eq!(recv_json(&mut controller).await["type"], "error");

    expect_silence(&mut target).await;
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_ids_and_missing_roles_are_refused() {
    let relay = start_relay(8).await;
    let _first = relay.connect(Role::Target, "tgt-1").await;

    let url = endpoint_url(&relay.ws_base(), Role::Target, "tgt-1").expect("url");
    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 409),
        Err(err) => panic!("expected 409, got {err}"),
        Ok(_) => panic!("duplicate target id was accepted"),
    }

    // The same id is fine for the other role.
    let _controller = relay.connect(Role::Controller, "tgt-1").await;

    match connect_async(format!("{}/ws?id=x", relay.ws_base())).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 400),
        Err(err) => panic!("expected 400, got {err}"),
        Ok(_) => panic!("connection without a role was accepted"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn per_sender_order_is_preserved() {
    let relay = start_relay(64).await;
    let mut target = relay.connect(Role::Target, "tgt-1").await;
    let mut controller = relay.connect(Role::Controller, "ctl-1").await;
    assert_eq!(recv_json(&mut target).await["type"], "controller-status");

    for request_id in 1..=20 {
        send_json(
            &mut controller,
            json!({ "type": "command", "command": "flashlight", "requestId": request_id }),
        )
        .await;
    }
    for expected in 1..=20 {
        assert_eq!(recv_json(&mut target).await["requestId"], expected);
    }
}

#[test_timeout::tokio_timeout_test]
async fn envelopes_for_absent_endpoints_are_dropped() {
    let relay = start_relay(8).await;
    let mut target = relay.connect(Role::Target, "tgt-1").await;

    send_json(
        &mut target,
        json!({ "type": "response", "controllerId": "nobody", "command": "sms", "response": {}, "requestId": 1 }),
    )
    .await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stats = relay.stats().await;
        if stats["connections"][0]["envelopes_dropped"] == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "drop never recorded");
        sleep(Duration::from_millis(10)).await;
    }

    // A controller connecting afterwards does not receive the stale response.
    let mut late = relay.connect(Role::Controller, "nobody").await;
    assert_eq!(recv_json(&mut late).await["type"], "target-status");
    expect_silence(&mut late).await;
}

fn target_config(relay: &TestRelay, target_id: &str, authorizer: AuthorizerKind) -> TargetConfig {
    TargetConfig {
        relay_url: relay.ws_base(),
        target_id: target_id.to_string(),
        authorizer,
        decision_timeout: Duration::from_secs(5),
        reconnect_delay: Duration::from_millis(100),
    }
}

fn send_args(relay: &TestRelay, controller: &str, target: &str, command: &str) -> SendArgs {
    SendArgs {
        url: relay.ws_base(),
        target: Some(target.to_string()),
        controller_id: Some(controller.to_string()),
        request_id: 1,
        wait_secs: 5,
        command: command.to_string(),
        args: Vec::new(),
    }
}

#[test_timeout::tokio_timeout_test]
async fn controller_drives_a_live_target_through_the_relay() {
    let relay = start_relay(16).await;
    let agent = TargetAgent::new(
        target_config(&relay, "phone-1", AuthorizerKind::Allow),
        simulated_dispatcher(),
        Arc::new(PromptAuthorizer::allow_all()),
    );
    let running = tokio::spawn(async move {
        let _ = agent.run().await;
    });
    relay.wait_for(Role::Target, "phone-1", true).await;

    let mut camera = send_args(&relay, "ctl-a", "phone-1", "camera");
    camera.args = vec!["action=toggle".to_string()];
    let report = send_command(&camera).await.expect("camera");
    let decision = report.decision.expect("binding decision");
    assert!(decision.granted);
    assert!(decision.permissions.contains(&PermissionKind::Camera));
    assert_eq!(
        report.response.response,
        ResponsePayload::Success(json!({ "status": "active", "message": "Camera feed activated" }))
    );

    // Once ctl-a has gone, its disconnect reaches the target ahead of anything
    // ctl-b sends, so ctl-b starts a fresh binding.
    relay.wait_for(Role::Controller, "ctl-a", false).await;
    let report = send_command(&send_args(&relay, "ctl-b", "phone-1", "sms"))
        .await
        .expect("sms");
    assert!(report.decision.expect("decision").granted);
    assert!(report.response.is_success());

    running.abort();
}

#[test_timeout::tokio_timeout_test]
async fn denied_target_answers_permission_denied() {
    let relay = start_relay(16).await;
    let agent = TargetAgent::new(
        target_config(&relay, "phone-2", AuthorizerKind::Deny),
        simulated_dispatcher(),
        Arc::new(PromptAuthorizer::deny_all()),
    );
    let running = tokio::spawn(async move {
        let _ = agent.run().await;
    });
    relay.wait_for(Role::Target, "phone-2", true).await;

    let report = send_command(&send_args(&relay, "ctl-a", "phone-2", "files"))
        .await
        .expect("files");
    let decision = report.decision.expect("decision");
    assert!(!decision.granted);
    assert!(decision.permissions.is_empty());
    assert_eq!(report.response.error_code(), Some(ErrorCode::PermissionDenied));

    let report = send_command(&send_args(&relay, "ctl-b", "phone-2", "self-destruct"))
        .await
        .expect("unknown");
    assert!(report.decision.is_none());
    assert_eq!(report.response.error_code(), Some(ErrorCode::PermissionDenied));

    running.abort();
}
