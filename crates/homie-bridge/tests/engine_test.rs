//! End-to-end engine flows against the in-memory transport.

use async_trait::async_trait;
use homie_bridge::engine::{BridgeEngine, EngineConfig};
use homie_bridge::profiles::{TasmotaProfile, VendorProfile, Zigbee2MqttProfile};
use homie_bridge::transport::{MemoryTransport, Transport};
use homie_bridge::{BridgeError, BridgeResult, DeviceState, OutboundMessage};
use std::sync::Arc;
use std::time::Duration;

const STATUS: &[u8] = br#"{"Status":{"Module":1,"FriendlyName":["Kitchen Lamp"],"Topic":"dev1","Power":0}}"#;

fn engine_with(
    profile: Arc<dyn VendorProfile>,
    required: &[&str],
) -> (Arc<BridgeEngine>, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let config = EngineConfig {
        required_nodes: required.iter().map(|s| s.to_string()).collect(),
        structure_resend: None,
        ..Default::default()
    };
    let engine = BridgeEngine::new(config, profile, transport.clone());
    (engine, transport)
}

/// A Tasmota engine that has seen the status and power of `dev1`.
async fn tasmota_device() -> (Arc<BridgeEngine>, Arc<MemoryTransport>) {
    let (engine, transport) = engine_with(Arc::new(TasmotaProfile), &["STATUS", "POWER"]);
    engine
        .on_message("stat/#", "stat/dev1/STATUS", STATUS)
        .await
        .unwrap();
    engine
        .on_message("stat/#", "stat/dev1/POWER", b"OFF")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    (engine, transport)
}

fn count(transport: &MemoryTransport, topic: &str, payload: &str) -> usize {
    transport
        .payloads(topic)
        .iter()
        .filter(|p| p.as_str() == payload)
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_tasmota_device_becomes_ready_with_required_nodes() {
    let (engine, transport) = engine_with(Arc::new(TasmotaProfile), &["STATUS", "POWER"]);

    engine
        .on_message("stat/#", "stat/dev1/STATUS", STATUS)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // POWER is still missing
    assert_eq!(count(&transport, "homie/dev1/$state", "ready"), 0);
    assert_eq!(transport.payloads("homie/dev1/$name").last().map(String::as_str), Some("Kitchen Lamp"));

    engine
        .on_message("stat/#", "stat/dev1/POWER", b"ON")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(count(&transport, "homie/dev1/$state", "ready"), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count(&transport, "homie/dev1/$state", "ready"), 1);

    assert_eq!(transport.payloads("homie/dev1/$homie")[0], "3.0");
    assert_eq!(
        transport.payloads("homie/dev1/$nodes").last().map(String::as_str),
        Some("STATUS,POWER")
    );
    assert_eq!(
        transport.payloads("homie/dev1/POWER/$properties").last().map(String::as_str),
        Some("powerSwitch")
    );
    assert_eq!(
        transport.payloads("homie/dev1/POWER/powerSwitch/$datatype").last().map(String::as_str),
        Some("boolean")
    );
    assert_eq!(
        transport.payloads("homie/dev1/POWER/powerSwitch/$settable").last().map(String::as_str),
        Some("true")
    );
    assert_eq!(transport.payloads("homie/dev1/POWER/powerSwitch"), vec!["true"]);

    let state = engine
        .registry()
        .resolve("dev1")
        .unwrap()
        .with(|d| d.state())
        .await;
    assert_eq!(state, DeviceState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_structure_published_before_values() {
    let (_engine, transport) = tasmota_device().await;

    let topics: Vec<String> = transport.published().into_iter().map(|m| m.topic).collect();
    let datatype = topics
        .iter()
        .position(|t| t == "homie/dev1/POWER/powerSwitch/$datatype")
        .unwrap();
    let value = topics
        .iter()
        .position(|t| t == "homie/dev1/POWER/powerSwitch")
        .unwrap();
    assert!(datatype < value);
}

#[tokio::test(start_paused = true)]
async fn test_structural_changes_settle_into_one_ready() {
    let (engine, transport) = engine_with(Arc::new(TasmotaProfile), &["STATUS", "POWER"]);

    engine
        .on_message("stat/#", "stat/dev1/STATUS", STATUS)
        .await
        .unwrap();
    engine
        .on_message("stat/#", "stat/dev1/POWER", b"ON")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine
        .on_message("tele/#", "tele/dev1/SENSOR", br#"{"ENERGY":{"Voltage":230}}"#)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(4500)).await;
    // The first timer elapsed but was superseded
    assert_eq!(count(&transport, "homie/dev1/$state", "ready"), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(&transport, "homie/dev1/$state", "ready"), 1);
    assert_eq!(
        transport.payloads("homie/dev1/$nodes").last().map(String::as_str),
        Some("STATUS,POWER,SENSOR")
    );
}

#[tokio::test(start_paused = true)]
async fn test_value_update_is_not_structural() {
    let (engine, transport) = tasmota_device().await;
    let nodes_before = transport.payloads("homie/dev1/$nodes").len();

    engine
        .on_message("stat/#", "stat/dev1/POWER", b"ON")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(transport.payloads("homie/dev1/$nodes").len(), nodes_before);
    assert_eq!(count(&transport, "homie/dev1/$state", "ready"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_last_write_wins() {
    let (engine, transport) = tasmota_device().await;

    for payload in [&b"ON"[..], b"OFF", b"ON"] {
        engine
            .on_message("stat/#", "stat/dev1/POWER", payload)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let values = transport.payloads("homie/dev1/POWER/powerSwitch");
    assert_eq!(values.last().map(String::as_str), Some("true"));
    assert!(transport
        .published()
        .iter()
        .filter(|m| m.topic == "homie/dev1/POWER/powerSwitch")
        .all(|m| m.retain));
}

#[tokio::test(start_paused = true)]
async fn test_homie_write_is_forwarded_and_cleared() {
    let (engine, transport) = tasmota_device().await;
    transport.clear();

    engine
        .on_write("homie/dev1/POWER/powerSwitch/set", b"true")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        transport.commands(),
        vec![("cmnd/dev1/POWER".to_string(), "ON".to_string())]
    );
    let cleared: Vec<_> = transport
        .published()
        .into_iter()
        .filter(|m| m.topic == "homie/dev1/POWER/powerSwitch/set")
        .collect();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].payload, "");
    assert!(cleared[0].retain);

    engine
        .on_write("homie/dev1/POWER/powerSwitch/set", b"false")
        .await
        .unwrap();
    assert_eq!(
        transport.commands().last(),
        Some(&("cmnd/dev1/POWER".to_string(), "OFF".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_write_is_ignored() {
    let (engine, transport) = tasmota_device().await;
    transport.clear();

    engine
        .on_write("homie/dev1/POWER/powerSwitch/set", b"")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(transport.commands().is_empty());
    assert!(transport.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_to_read_only_property_fails() {
    let (engine, transport) = tasmota_device().await;
    transport.clear();

    let err = engine
        .on_write("homie/dev1/STATUS/Module/set", b"2")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Routing(_)));
    assert!(transport.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_is_lost_then_recovers() {
    let (engine, transport) = tasmota_device().await;

    tokio::time::sleep(Duration::from_secs(6 * 3600 + 300)).await;
    assert_eq!(count(&transport, "homie/dev1/$state", "lost"), 1);
    assert_eq!(
        transport.payloads("homie/dev1/$state").last().map(String::as_str),
        Some("lost")
    );

    engine
        .on_message("stat/#", "stat/dev1/POWER", b"ON")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let states = transport.payloads("homie/dev1/$state");
    let tail: Vec<&str> = states.iter().rev().take(2).rev().map(String::as_str).collect();
    assert_eq!(tail, vec!["init", "ready"]);
    assert_eq!(count(&transport, "homie/dev1/$state", "lost"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stats_published_periodically() {
    let (_engine, transport) = tasmota_device().await;
    let before = transport.payloads("homie/dev1/$stats/uptime").len();

    tokio::time::sleep(Duration::from_secs(121)).await;
    let uptimes = transport.payloads("homie/dev1/$stats/uptime");
    assert!(uptimes.len() > before);
    assert_eq!(transport.payloads("homie/dev1/$stats/interval")[0], "120");
}

#[tokio::test(start_paused = true)]
async fn test_zigbee_discovery_then_report() {
    let (engine, transport) = engine_with(Arc::new(Zigbee2MqttProfile), &[]);

    engine
        .on_message(
            "zigbee2mqtt/#",
            "zigbee2mqtt/bridge/config/devices",
            br#"[
                {"ieeeAddr":"0x00","type":"Coordinator","friendly_name":"Coordinator"},
                {"ieeeAddr":"0x01","type":"EndDevice","friendly_name":"switch1","modelID":"lumi.sensor_switch"}
            ]"#,
        )
        .await
        .unwrap();
    assert!(engine.registry().resolve("Coordinator").is_none());
    assert!(engine.registry().resolve("switch1").is_some());

    engine
        .on_message(
            "zigbee2mqtt/#",
            "zigbee2mqtt/switch1",
            br#"{"battery":91,"voltage":3005,"linkquality":42,"click":"single"}"#,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(count(&transport, "homie/switch1/$state", "ready"), 1);
    assert_eq!(transport.payloads("homie/switch1/main/battery").last().map(String::as_str), Some("91"));

    let click: Vec<_> = transport
        .published()
        .into_iter()
        .filter(|m| m.topic == "homie/switch1/main/click")
        .collect();
    assert_eq!(click.len(), 1);
    assert_eq!(click[0].payload, "single");
    assert!(!click[0].retain);

    // Stats pick up the reported link quality on the next heartbeat
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(
        transport.payloads("homie/switch1/$stats/signal").last().map(String::as_str),
        Some("42")
    );
    assert_eq!(
        transport.payloads("homie/switch1/$stats/battery").last().map(String::as_str),
        Some("91")
    );
}

#[tokio::test(start_paused = true)]
async fn test_zigbee_bridge_messages_are_skipped() {
    let (engine, transport) = engine_with(Arc::new(Zigbee2MqttProfile), &[]);
    engine
        .on_message("zigbee2mqtt/#", "zigbee2mqtt/bridge/state", b"online")
        .await
        .unwrap();
    assert!(engine.registry().is_empty());
    assert!(transport.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resend_structure_reannounces() {
    let (engine, transport) = tasmota_device().await;
    let inits = count(&transport, "homie/dev1/$state", "init");

    engine.resend_structure().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(count(&transport, "homie/dev1/$state", "init"), inits + 1);
    assert_eq!(count(&transport, "homie/dev1/$state", "ready"), 2);
}

async fn state_of(engine: &BridgeEngine, device_id: &str) -> DeviceState {
    engine
        .registry()
        .resolve(device_id)
        .unwrap()
        .with(|d| d.state())
        .await
}

/// States published on `$state` after the last `lost`.
fn states_after_lost(transport: &MemoryTransport) -> Vec<String> {
    let states = transport.payloads("homie/dev1/$state");
    let lost_at = states.iter().rposition(|s| s == "lost").unwrap();
    states[lost_at + 1..].to_vec()
}

#[tokio::test(start_paused = true)]
async fn test_resend_keeps_lost_device_lost() {
    let (engine, transport) = tasmota_device().await;

    tokio::time::sleep(Duration::from_secs(6 * 3600 + 300)).await;
    assert_eq!(state_of(&engine, "dev1").await, DeviceState::Lost);

    engine.resend_structure().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(state_of(&engine, "dev1").await, DeviceState::Lost);
    assert!(states_after_lost(&transport).is_empty());
    assert_eq!(count(&transport, "homie/dev1/$state", "ready"), 1);

    // Traffic is what brings it back
    engine
        .on_message("stat/#", "stat/dev1/POWER", b"ON")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(state_of(&engine, "dev1").await, DeviceState::Ready);
    assert_eq!(states_after_lost(&transport), vec!["init", "ready"]);
}

#[tokio::test(start_paused = true)]
async fn test_lost_device_returning_with_new_node_announces_once() {
    let (engine, transport) = tasmota_device().await;
    tokio::time::sleep(Duration::from_secs(6 * 3600 + 300)).await;
    let nodes_before = transport.payloads("homie/dev1/$nodes").len();

    engine
        .on_message("tele/#", "tele/dev1/SENSOR", br#"{"ENERGY":{"Voltage":230}}"#)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(states_after_lost(&transport), vec!["init", "ready"]);
    let nodes = transport.payloads("homie/dev1/$nodes");
    assert_eq!(nodes.len(), nodes_before + 1);
    assert_eq!(nodes.last().map(String::as_str), Some("STATUS,POWER,SENSOR"));
}

#[tokio::test(start_paused = true)]
async fn test_publish_failures_leave_model_intact() {
    let (engine, transport) = engine_with(Arc::new(TasmotaProfile), &["STATUS", "POWER"]);
    transport.fail_publishes(true);

    engine
        .on_message("stat/#", "stat/dev1/STATUS", STATUS)
        .await
        .unwrap();
    engine
        .on_message("stat/#", "stat/dev1/POWER", b"ON")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(transport.published().is_empty());
    assert_eq!(engine.registry().len(), 1);
    assert_eq!(state_of(&engine, "dev1").await, DeviceState::Ready);

    transport.fail_publishes(false);
    engine.resend_structure().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(transport.payloads("homie/dev1/$homie"), vec!["3.0"]);
    assert_eq!(transport.payloads("homie/dev1/$name"), vec!["Kitchen Lamp"]);
    assert_eq!(transport.payloads("homie/dev1/$nodes"), vec!["STATUS,POWER"]);
    assert_eq!(
        transport.payloads("homie/dev1/POWER/$properties"),
        vec!["powerSwitch"]
    );
    assert_eq!(
        transport.payloads("homie/dev1/POWER/powerSwitch/$settable"),
        vec!["true"]
    );
    assert_eq!(transport.payloads("homie/dev1/$state"), vec!["init", "ready"]);

    // Routing still works from the surviving model
    engine
        .on_write("homie/dev1/POWER/powerSwitch/set", b"true")
        .await
        .unwrap();
    assert_eq!(
        transport.commands(),
        vec![("cmnd/dev1/POWER".to_string(), "ON".to_string())]
    );
}

/// A Homie broker that accepts the session but never acknowledges a publish.
struct StalledTransport;

#[async_trait]
impl Transport for StalledTransport {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn register_device(&self, _device_id: &str, _device_topic: &str) -> BridgeResult<()> {
        Ok(())
    }

    async fn subscribe(&self, _device_id: &str, _filter: &str) -> BridgeResult<()> {
        Ok(())
    }

    async fn publish(&self, _device_id: &str, _message: &OutboundMessage) -> BridgeResult<()> {
        std::future::pending().await
    }

    async fn publish_command(&self, _topic: &str, _payload: &str) -> BridgeResult<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_publisher_does_not_block_messages() {
    let config = EngineConfig {
        required_nodes: vec!["STATUS".to_string(), "POWER".to_string()],
        structure_resend: None,
        outbox_depth: 10,
        ..Default::default()
    };
    let engine = BridgeEngine::new(config, Arc::new(TasmotaProfile), Arc::new(StalledTransport));

    for device in ["dev1", "dev2"] {
        let topic = format!("stat/{}/STATUS", device);
        let handled = tokio::time::timeout(
            Duration::from_secs(2),
            engine.on_message("stat/#", &topic, STATUS),
        )
        .await;
        assert!(matches!(handled, Ok(Ok(()))), "{} blocked", device);
    }

    for i in 0..50 {
        let payload: &[u8] = if i % 2 == 0 { b"ON" } else { b"OFF" };
        let handled = tokio::time::timeout(
            Duration::from_secs(2),
            engine.on_message("stat/#", "stat/dev1/POWER", payload),
        )
        .await;
        assert!(matches!(handled, Ok(Ok(()))));
    }

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(state_of(&engine, "dev1").await, DeviceState::Ready);
    assert_eq!(engine.registry().len(), 2);
}
