//! End-to-end tests: a WebSocket host client talks to a running integration,
//! which talks to a scripted player over TCP.
//!
//! ```text
//! Host (tokio-tungstenite client) ──ws──► integration ──tcp──► DeviceSimulator
//! ```
//!
//! Timings (grace period, backoff) are shortened so the outage scenarios run
//! in well under a second each.

mod common;

use std::collections::VecDeque;
use std::time::Duration;

use common::{DeviceSimulator, Script};
use futures_util::{SinkExt, StreamExt};
use kscape_core::protocol::messages::*;
use kscape_integration::domain::{BridgeConfig, DeviceEndpoint};
use kscape_integration::infrastructure::storage::{load_config, TomlConfigSink};
use kscape_integration::infrastructure::{start, BridgeHandle};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(3);

// ── Harness ───────────────────────────────────────────────────────────────────

fn test_config(device: Option<DeviceEndpoint>) -> BridgeConfig {
    BridgeConfig {
        ws_bind_addr: "127.0.0.1:0".parse().unwrap(),
        device,
        grace_period: Duration::from_millis(300),
        probe_interval: Duration::from_secs(30),
        command_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        backoff_initial: Duration::from_millis(50),
        backoff_max: Duration::from_millis(100),
        ..BridgeConfig::default()
    }
}

fn endpoint(sim: &DeviceSimulator) -> DeviceEndpoint {
    DeviceEndpoint::from_address(&sim.addr().to_string(), Some("Theater")).unwrap()
}

struct Host {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: VecDeque<Value>,
    next_id: u64,
}

impl Host {
    async fn connect(bridge: &BridgeHandle) -> Self {
        let (ws, _) = connect_async(format!("ws://{}", bridge.local_addr()))
            .await
            .expect("host must connect");
        Self {
            ws,
            events: VecDeque::new(),
            next_id: 1,
        }
    }

    async fn read_frame(&mut self, deadline: Instant) -> Option<Value> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, self.ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => Some(serde_json::from_str(&text).unwrap()),
            Ok(Some(Ok(_))) => Some(Value::Null),
            _ => None,
        }
    }

    /// Sends a request and returns its response; events seen meanwhile are
    /// kept for [`Host::wait_event`].
    async fn request(&mut self, msg: &str, msg_data: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let frame = json!({ "kind": "req", "id": id, "msg": msg, "msg_data": msg_data });
        self.ws.send(Message::Text(frame.to_string())).await.unwrap();

        let deadline = Instant::now() + WAIT;
        loop {
            let frame = self
                .read_frame(deadline)
                .await
                .unwrap_or_else(|| panic!("no response to {msg}"));
            if frame["kind"] == "resp" && frame["req_id"] == id {
                return frame;
            }
            if frame["kind"] == "event" {
                self.events.push_back(frame);
            }
        }
    }

    async fn command(&mut self, entity_id: &str, cmd_id: &str, params: Value) -> Value {
        self.request(
            "entity_command",
            json!({ "entity_id": entity_id, "cmd_id": cmd_id, "params": params }),
        )
        .await
    }

    /// Waits for an event matching `pred`, consuming events up to it.
    async fn wait_event(&mut self, pred: impl Fn(&Value) -> bool) -> Option<Value> {
        while let Some(event) = self.events.pop_front() {
            if pred(&event) {
                return Some(event);
            }
        }
        let deadline = Instant::now() + WAIT;
        while let Some(frame) = self.read_frame(deadline).await {
            if frame["kind"] == "event" && pred(&frame) {
                return Some(frame);
            }
        }
        None
    }

    /// Waits for an `entity_change` of `entity_id` whose attribute `key`
    /// equals `value`.
    async fn wait_attribute(&mut self, entity_id: &str, key: &str, value: Value) -> bool {
        self.wait_event(|e| {
            e["msg"] == "entity_change"
                && e["msg_data"]["entity_id"] == entity_id
                && e["msg_data"]["attributes"][key] == value
        })
        .await
        .is_some()
    }
}

async fn subscribed_host(bridge: &BridgeHandle) -> Host {
    let mut host = Host::connect(bridge).await;
    let resp = host.request("subscribe_events", json!({})).await;
    assert_eq!(resp["code"], 200);
    host
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_driver_version_and_entities() {
    // Arrange
    let sim = DeviceSimulator::start().await;
    let device = endpoint(&sim);
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(Some(device.clone())), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = Host::connect(&bridge).await;

    // Act
    let version = host.request("get_driver_version", json!({})).await;
    let entities = host.request("get_available_entities", json!({})).await;

    // Assert
    assert_eq!(version["code"], 200);
    assert!(version["msg_data"]["version"]["driver"].is_string());
    let ids: Vec<&str> = entities["msg_data"]["available_entities"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["entity_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 5);
    assert!(ids.contains(&format!("media_player.{}", device.id).as_str()));
    assert!(ids.contains(&format!("remote.{}", device.id).as_str()));
    // Nothing connects until a host asks for state.
    assert_eq!(sim.connections(), 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_connects_and_publishes_snapshot() {
    let sim = DeviceSimulator::start().await;
    sim.script(GET_PLAYING_TITLE_NAME, Script::reply(TITLE_NAME, &["Heat"]));
    let device = endpoint(&sim);
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(Some(device.clone())), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();

    let mut host = subscribed_host(&bridge).await;

    let media_player = format!("media_player.{}", device.id);
    assert!(host.wait_attribute(&media_player, "state", json!("ON")).await);
    let states = host.request("get_entity_states", json!({})).await;
    let player = states["msg_data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["entity_id"] == media_player.as_str())
        .unwrap()
        .clone();
    assert_eq!(player["attributes"]["media_title"], "Heat");
    assert!(sim.received_names().iter().any(|n| n == GET_PLAY_STATUS));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_player_event_updates_subscribers() {
    // Arrange
    let sim = DeviceSimulator::start().await;
    let device = endpoint(&sim);
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(Some(device.clone())), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = subscribed_host(&bridge).await;
    let media_player = format!("media_player.{}", device.id);
    assert!(host.wait_attribute(&media_player, "state", json!("ON")).await);

    // Act
    sim.push_event(PLAY_STATUS, &["2", "0", "01", "05400", "00120", "001", "00600", "00120"]);

    // Assert
    assert!(host.wait_attribute(&media_player, "state", json!("PLAYING")).await);
    let sensor = format!("sensor.play_status.{}", device.id);
    assert!(host.wait_attribute(&sensor, "value", json!("playing")).await);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_digit_command_reaches_player() {
    let sim = DeviceSimulator::start().await;
    let device = endpoint(&sim);
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(Some(device.clone())), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = subscribed_host(&bridge).await;
    let media_player = format!("media_player.{}", device.id);
    assert!(host.wait_attribute(&media_player, "state", json!("ON")).await);

    let resp = host.command(&media_player, "digit_5", json!({})).await;

    assert_eq!(resp["code"], 200);
    let last = sim.received().pop().unwrap();
    assert_eq!(last.name, KEYBOARD_CHARACTER);
    assert_eq!(last.params, vec!["5".to_string()]);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_digit_is_rejected_before_sending() {
    // Arrange
    let sim = DeviceSimulator::start().await;
    let device = endpoint(&sim);
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(Some(device.clone())), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = subscribed_host(&bridge).await;
    let media_player = format!("media_player.{}", device.id);
    assert!(host.wait_attribute(&media_player, "state", json!("ON")).await);
    sim.clear_received();

    // Act
    let resp = host.command(&media_player, "digit", json!({ "value": 15 })).await;

    // Assert
    assert_eq!(resp["code"], 400);
    assert!(sim.received().is_empty());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_remote_sequence_is_sent_in_order() {
    let sim = DeviceSimulator::start().await;
    let device = endpoint(&sim);
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(Some(device.clone())), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = subscribed_host(&bridge).await;
    let remote = format!("remote.{}", device.id);
    assert!(host.wait_attribute(&remote, "state", json!("ON")).await);
    sim.clear_received();

    let resp = host
        .command(&remote, "send_cmd_sequence", json!({ "sequence": ["up", "up", "select"] }))
        .await;

    assert_eq!(resp["code"], 200);
    assert_eq!(sim.received_names(), vec![UP, UP, SELECT]);
    assert_eq!(sim.max_in_flight(), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_lost_player_goes_unavailable_after_grace_period() {
    // Arrange
    let sim = DeviceSimulator::start().await;
    let device = endpoint(&sim);
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(Some(device.clone())), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = subscribed_host(&bridge).await;
    let media_player = format!("media_player.{}", device.id);
    assert!(host.wait_attribute(&media_player, "state", json!("ON")).await);

    // Act: the player disappears and stays gone
    let lost_at = Instant::now();
    sim.shutdown();

    // Assert
    assert!(host.wait_attribute(&media_player, "state", json!("UNAVAILABLE")).await);
    assert!(lost_at.elapsed() >= Duration::from_millis(250));
    let resp = host.command(&media_player, "play_pause", json!({})).await;
    assert_eq!(resp["code"], 503);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_restores_fresh_snapshot() {
    // Arrange
    let sim = DeviceSimulator::start().await;
    let device = endpoint(&sim);
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(Some(device.clone())), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = subscribed_host(&bridge).await;
    let media_player = format!("media_player.{}", device.id);
    assert!(host.wait_attribute(&media_player, "state", json!("ON")).await);

    // Act: the player drops the link and comes back with a new title loaded
    sim.script(GET_PLAYING_TITLE_NAME, Script::reply(TITLE_NAME, &["Alien"]));
    sim.drop_connection();

    // Assert
    assert!(host.wait_attribute(&media_player, "media_title", json!("Alien")).await);
    assert!(sim.wait_for_connections(2, WAIT).await);
    let resp = host.command(&media_player, "play_pause", json!({})).await;
    assert_eq!(resp["code"], 200);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_setup_persists_player_and_registers_entities() {
    // Arrange: no player configured yet
    let sim = DeviceSimulator::start().await;
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(None), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = Host::connect(&bridge).await;
    let before = host.request("get_available_entities", json!({})).await;
    assert_eq!(before["msg_data"]["available_entities"], json!([]));

    // Act
    let resp = host
        .request(
            "setup_driver",
            json!({ "setup_data": { "address": sim.addr().to_string(), "name": "Theater" } }),
        )
        .await;

    // Assert
    assert_eq!(resp["code"], 200);
    assert!(host
        .wait_event(|e| e["msg"] == "driver_setup_change" && e["msg_data"]["state"] == "OK")
        .await
        .is_some());
    let stored = load_config(dir.path()).unwrap().device.unwrap();
    assert_eq!(stored.host, "127.0.0.1");
    assert_eq!(stored.port, sim.addr().port());
    assert_eq!(stored.name, "Theater");
    let after = host.request("get_available_entities", json!({})).await;
    assert_eq!(after["msg_data"]["available_entities"].as_array().unwrap().len(), 5);
    assert!(sim.wait_for_connections(1, WAIT).await);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_invalid_setup_address_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = start(test_config(None), Box::new(TomlConfigSink::new(dir.path())))
        .await
        .unwrap();
    let mut host = Host::connect(&bridge).await;

    let resp = host
        .request("setup_driver", json!({ "setup_data": { "address": "player:notaport" } }))
        .await;

    assert_eq!(resp["code"], 400);
    assert!(host
        .wait_event(|e| e["msg"] == "driver_setup_change" && e["msg_data"]["state"] == "ERROR")
        .await
        .is_some());
    assert!(load_config(dir.path()).unwrap().device.is_none());

    bridge.shutdown().await;
}
