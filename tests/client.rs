//! End-to-end tests against an in-process mock core.
//!
//! The mock accepts QRC WebSocket connections, pushes EngineStatus, and
//! answers the design-sync sequence (GetComponents, GetControls,
//! AddComponentControl, Poll, AutoPoll) so a real client session comes up.

use futures_util::{SinkExt, StreamExt};
use qsys_qrc::{ClientOptions, ConnectionState, QrcClient, QrcError};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

type Ws = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> Ws {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next inbound frame that carries a request id; NoOp heartbeats and other
/// notifications are skipped.
async fn recv_request(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a request")
            .expect("socket ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value.get("id").is_some() {
                return value;
            }
        }
    }
}

async fn respond(ws: &mut Ws, request: &Value, result: Value) {
    send_json(
        ws,
        json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }),
    )
    .await;
}

fn engine_status_frame(code: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "EngineStatus",
        "params": {
            "State": "Active",
            "Platform": "Core 110f",
            "DesignName": "Test Design",
            "DesignCode": code,
            "IsRedundant": false,
            "IsEmulator": true,
            "Status": { "Code": 0, "String": "OK" }
        }
    })
}

fn control_json(name: &str, direction: &str, value: Value, string: &str, position: f64) -> Value {
    json!({
        "Name": name,
        "Type": "Float",
        "Value": value,
        "String": string,
        "Position": position,
        "Direction": direction,
        "ValueMin": -100.0,
        "ValueMax": 20.0,
        "StringMin": "-100.0dB",
        "StringMax": "20.0dB"
    })
}

struct MockDesign {
    components: Vec<(&'static str, Vec<Value>)>,
    /// Changes answered to the baseline poll
    baseline: Vec<Value>,
}

impl MockDesign {
    fn mixer() -> Self {
        Self {
            components: vec![(
                "Mixer",
                vec![
                    control_json("gain", "Read/Write", json!(-6.0), "-6.0dB", 0.4),
                    control_json("meter", "Read", json!(-20.0), "-20.0dB", 0.2),
                ],
            )],
            baseline: Vec::new(),
        }
    }

    fn router() -> Self {
        Self {
            components: vec![(
                "Router",
                vec![control_json("select", "Read/Write", json!(1), "1", 0.0)],
            )],
            baseline: Vec::new(),
        }
    }
}

/// Answer the design-sync sequence until AutoPoll has been acknowledged
async fn serve_sync(ws: &mut Ws, design: &MockDesign) {
    let mut baseline_served = false;
    loop {
        let request = recv_request(ws).await;
        match request["method"].as_str().unwrap() {
            "Component.GetComponents" => {
                let list: Vec<Value> = design
                    .components
                    .iter()
                    .map(|(name, _)| json!({ "Name": name, "Type": "mixer", "Properties": [] }))
                    .collect();
                respond(ws, &request, json!(list)).await;
            }
            "Component.GetControls" => {
                let name = request["params"]["Name"].as_str().unwrap().to_string();
                let controls = design
                    .components
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, c)| c.clone())
                    .unwrap_or_default();
                respond(ws, &request, json!({ "Name": name, "Controls": controls })).await;
            }
            "ChangeGroup.AddComponentControl" => {
                respond(ws, &request, json!(true)).await;
            }
            "ChangeGroup.Poll" => {
                let id = request["params"]["Id"].clone();
                let changes = if baseline_served {
                    Vec::new()
                } else {
                    baseline_served = true;
                    design.baseline.clone()
                };
                respond(ws, &request, json!({ "Id": id, "Changes": changes })).await;
            }
            "ChangeGroup.AutoPoll" => {
                respond(ws, &request, json!(true)).await;
                return;
            }
            other => panic!("unexpected request during sync: {}", other),
        }
    }
}

fn fast_options() -> ClientOptions {
    ClientOptions {
        reconnect_base_delay: Duration::from_millis(100),
        reconnect_growth: 1.0,
        request_timeout: Duration::from_secs(2),
        // Wide enough that back-to-back writes always land inside one window
        write_debounce: Duration::from_millis(150),
        ..ClientOptions::default()
    }
}

/// Bring a client and mock core up to the connected state
async fn connected_pair(design: &MockDesign) -> (TcpListener, QrcClient, Ws) {
    let (listener, url) = listen().await;
    let client = QrcClient::with_options(url, fast_options()).unwrap();
    let mut status = client.subscribe_status();
    client.connect().await;

    let mut ws = accept(&listener).await;
    send_json(&mut ws, engine_status_frame("design-1")).await;
    serve_sync(&mut ws, design).await;

    loop {
        let s = tokio::time::timeout(Duration::from_secs(5), status.recv())
            .await
            .expect("never connected")
            .unwrap();
        if s.connected {
            break;
        }
    }
    (listener, client, ws)
}

#[tokio::test]
async fn connected_is_gated_on_engine_status() {
    let (listener, url) = listen().await;
    let client = QrcClient::with_options(url, fast_options()).unwrap();
    let mut status = client.subscribe_status();
    client.connect().await;

    let mut ws = accept(&listener).await;

    // The socket being open is not enough to be connected
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(status.try_recv().unwrap().is_none());
    assert_eq!(
        client.connection_state(),
        ConnectionState::AwaitingEngineStatus
    );

    send_json(&mut ws, engine_status_frame("design-1")).await;
    serve_sync(&mut ws, &MockDesign::mixer()).await;

    let s = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .expect("never connected")
        .unwrap();
    assert!(s.connected);
    assert!(s.new_design);
    assert!(!s.no_reconnect);
    assert_eq!(s.engine_status.unwrap().design_code, "design-1");
    assert!(client.is_connected());

    client.disconnect().await;
}

#[tokio::test]
async fn design_is_cached_and_served_without_round_trips() {
    let design = MockDesign {
        baseline: vec![json!({
            "Component": "Mixer", "Name": "gain",
            "Value": -3.0, "String": "-3.0dB", "Position": 0.55
        })],
        ..MockDesign::mixer()
    };
    let (_listener, client, _ws) = connected_pair(&design).await;

    // No further requests are answered, so these must come from the cache
    let components = client.get_all_components().await.unwrap();
    assert_eq!(components.len(), 1);
    assert_eq!(components[0].name(), "Mixer");

    let mixer = client.get_component("Mixer").await.unwrap();
    let gain = mixer.control("gain").unwrap();
    // The baseline poll overrode the fetched value
    assert_eq!(gain.value(), json!(-3.0));
    assert_eq!(gain.string(), "-3.0dB");
    assert_eq!(gain.position(), 0.55);

    client.disconnect().await;
}

#[tokio::test]
async fn write_is_confirmed_by_one_debounced_poll() {
    let (_listener, client, mut ws) = connected_pair(&MockDesign::mixer()).await;

    let gain = client
        .get_component("Mixer")
        .await
        .unwrap()
        .control("gain")
        .unwrap();
    let mut changes = gain.changed();

    let writer = {
        let gain = gain.clone();
        tokio::spawn(async move {
            // Rapid repeated writes, as a slider drag would produce
            gain.set_value(3.0).await.unwrap();
            gain.set_value(5.0).await.unwrap();
        })
    };

    let set1 = recv_request(&mut ws).await;
    assert_eq!(set1["method"], json!("Component.Set"));
    assert_eq!(set1["params"]["Name"], json!("Mixer"));
    assert_eq!(set1["params"]["Controls"][0]["Value"], json!(3.0));
    respond(&mut ws, &set1, json!(true)).await;

    let set2 = recv_request(&mut ws).await;
    assert_eq!(set2["method"], json!("Component.Set"));
    respond(&mut ws, &set2, json!(true)).await;
    writer.await.unwrap();

    // One coalesced poll after the quiet window; echo the authoritative value
    let poll = recv_request(&mut ws).await;
    assert_eq!(poll["method"], json!("ChangeGroup.Poll"));
    respond(
        &mut ws,
        &poll,
        json!({
            "Id": poll["params"]["Id"],
            "Changes": [{
                "Component": "Mixer", "Name": "gain",
                "Value": 5.0, "String": "5.0dB", "Position": 0.8
            }]
        }),
    )
    .await;

    let snapshot = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no change event")
        .unwrap();
    assert_eq!(snapshot.value, json!(5.0));
    assert_eq!(gain.value(), json!(5.0));

    // The two writes coalesced: no second poll follows
    let extra = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(extra.is_err(), "expected no further traffic, got {:?}", extra);

    client.disconnect().await;
}

#[tokio::test]
async fn read_only_write_sends_no_wire_traffic() {
    let (_listener, client, mut ws) = connected_pair(&MockDesign::mixer()).await;

    let meter = client
        .get_component("Mixer")
        .await
        .unwrap()
        .control("meter")
        .unwrap();
    assert!(!meter.can_write());

    let err = meter.set_value(0.0).await.unwrap_err();
    assert!(matches!(err, QrcError::ReadOnly(_)));
    assert_eq!(meter.value(), json!(-20.0));

    // Nothing reached the core
    let extra = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(extra.is_err(), "expected no wire traffic, got {:?}", extra);

    client.disconnect().await;
}

#[tokio::test]
async fn position_only_delta_preserves_value_and_string() {
    let (_listener, client, mut ws) = connected_pair(&MockDesign::mixer()).await;

    let gain = client
        .get_component("Mixer")
        .await
        .unwrap()
        .control("gain")
        .unwrap();
    let mut changes = gain.changed();

    // Pushed auto-poll delta carrying only a position
    send_json(
        &mut ws,
        json!({
            "jsonrpc": "2.0",
            "method": "ChangeGroup.Poll",
            "params": {
                "Id": qsys_qrc::AUTO_POLL_GROUP_ID,
                "Changes": [{ "Component": "Mixer", "Name": "gain", "Position": 0.9 }]
            }
        }),
    )
    .await;

    let snapshot = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no change event")
        .unwrap();
    assert_eq!(snapshot.position, 0.9);
    assert_eq!(gain.position(), 0.9);
    assert_eq!(gain.value(), json!(-6.0));
    assert_eq!(gain.string(), "-6.0dB");

    client.disconnect().await;
}

#[tokio::test]
async fn design_change_rebuilds_cache_before_reconnecting_status() {
    let (_listener, client, mut ws) = connected_pair(&MockDesign::mixer()).await;
    let mut status = client.subscribe_status();

    // The core loads a different design and announces it
    send_json(&mut ws, engine_status_frame("design-2")).await;
    serve_sync(&mut ws, &MockDesign::router()).await;

    let s = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .expect("no status after design change")
        .unwrap();
    assert!(s.connected);
    assert!(s.new_design);
    assert_eq!(s.engine_status.unwrap().design_code, "design-2");

    // Old components are gone, new ones live
    let components = client.get_all_components().await.unwrap();
    assert_eq!(components.len(), 1);
    assert_eq!(components[0].name(), "Router");
    assert!(components[0].control("select").is_some());

    client.disconnect().await;
}

#[tokio::test]
async fn involuntary_drop_reconnects_and_resumes_design() {
    let (listener, client, ws) = connected_pair(&MockDesign::mixer()).await;
    let mut status = client.subscribe_status();

    drop(ws);

    // First the down transition...
    let s = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .expect("no status after drop")
        .unwrap();
    assert!(!s.connected);
    assert!(!s.no_reconnect);

    // ...then the client comes back on its own; same design code, and the
    // cache survives, so the sync skips the component fetch
    let mut ws = accept(&listener).await;
    send_json(&mut ws, engine_status_frame("design-1")).await;
    serve_sync(&mut ws, &MockDesign::mixer()).await;

    loop {
        let s = tokio::time::timeout(Duration::from_secs(5), status.recv())
            .await
            .expect("never reconnected")
            .unwrap();
        if s.connected {
            assert!(!s.new_design);
            break;
        }
    }
    assert!(client.is_connected());

    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_prevents_any_reconnection() {
    let (listener, client, _ws) = connected_pair(&MockDesign::mixer()).await;
    let mut status = client.subscribe_status();

    client.disconnect().await;

    let s = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .expect("no terminal status")
        .unwrap();
    assert!(!s.connected);
    assert!(s.no_reconnect);
    assert_eq!(client.connection_state(), ConnectionState::Stopped);

    // No reconnection attempt is ever scheduled
    let attempt = tokio::time::timeout(Duration::from_millis(400), listener.accept()).await;
    assert!(attempt.is_err(), "client reconnected after explicit disconnect");
}

#[tokio::test]
async fn exhausted_attempts_surface_as_terminal_status() {
    let (listener, url) = listen().await;
    drop(listener);

    let options = ClientOptions {
        max_reconnect_attempts: 2,
        ..fast_options()
    };
    let client = QrcClient::with_options(url, options).unwrap();
    let mut status = client.subscribe_status();
    client.connect().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let s = tokio::time::timeout_at(deadline, status.recv())
            .await
            .expect("never gave up")
            .unwrap();
        assert!(!s.connected);
        if s.no_reconnect {
            break;
        }
    }
    assert_eq!(client.connection_state(), ConnectionState::Stopped);
}
