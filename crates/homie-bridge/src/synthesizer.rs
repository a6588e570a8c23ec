//! Structure synthesizer.
//!
//! Produces the ordered Homie 3.0 messages describing a device. Everything
//! here is a pure function of the device model; queueing is left to
//! [`Device`](crate::device::Device).
//!
//! ```text
//! <base>/<dev>/$state = init          (only when leaving ready/lost)
//! <base>/<dev>/$homie, $name
//! <base>/<dev>/<node>/$name, $type, $properties
//! <base>/<dev>/<node>/<prop>/$name, $datatype, [$format], [$settable]
//! <base>/<dev>/$nodes
//! <base>/<dev>/$state = ready         (after the settle delay)
//! ```

use crate::device::{Device, DeviceState, Node};
use crate::message::OutboundMessage;
use chrono::{DateTime, Utc};

/// Homie convention version announced in `$homie`.
pub const HOMIE_VERSION: &str = "3.0";
/// Value of every node's `$type`.
pub const NODE_TYPE: &str = "nodeType";
/// Field list announced in `$stats`.
pub const STATS_FIELDS: &str = "uptime,signal,battery,voltage,firstSeen,lastSeen";

/// Timestamp format of `$stats/firstSeen` and `$stats/lastSeen`.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// `$state` token for `state`.
pub fn state_message(device_topic: &str, state: DeviceState) -> OutboundMessage {
    OutboundMessage::structural(format!("{}/$state", device_topic), state.to_string())
}

/// `$homie`, `$name` and the current `$state`, sent once when a device is created.
pub fn device_info(device: &Device) -> Vec<OutboundMessage> {
    let topic = device.topic();
    vec![
        OutboundMessage::structural(format!("{}/$homie", topic), HOMIE_VERSION),
        OutboundMessage::structural(format!("{}/$name", topic), device.name()),
        state_message(topic, device.state()),
    ]
}

/// Metadata of one node and all of its announced properties.
pub fn node_structure(node: &Node) -> Vec<OutboundMessage> {
    let properties = node.effective_properties();
    let names: Vec<&str> = properties.iter().map(|p| p.name.as_str()).collect();

    let mut messages = vec![
        OutboundMessage::structural(format!("{}/$name", node.topic), node.name.as_str()),
        OutboundMessage::structural(format!("{}/$type", node.topic), NODE_TYPE),
        OutboundMessage::structural(format!("{}/$properties", node.topic), names.join(",")),
    ];

    for property in properties {
        messages.push(OutboundMessage::structural(
            format!("{}/$name", property.topic),
            property.name.as_str(),
        ));
        messages.push(OutboundMessage::structural(
            format!("{}/$datatype", property.topic),
            property.kind.to_string(),
        ));
        if let Some(format) = &property.format {
            messages.push(OutboundMessage::structural(
                format!("{}/$format", property.topic),
                format.as_str(),
            ));
        }
        if property.settable {
            messages.push(OutboundMessage::structural(
                format!("{}/$settable", property.topic),
                "true",
            ));
        }
    }

    messages
}

/// Full structure of a device. Opens with `$state = init` unless the device
/// is already initialising; the closing `ready` is sent by the settle timer.
pub fn structure(device: &Device) -> Vec<OutboundMessage> {
    let topic = device.topic();
    let mut messages = Vec::new();

    if device.state() != DeviceState::Init {
        messages.push(state_message(topic, DeviceState::Init));
    }
    messages.push(OutboundMessage::structural(
        format!("{}/$homie", topic),
        HOMIE_VERSION,
    ));
    messages.push(OutboundMessage::structural(
        format!("{}/$name", topic),
        device.name(),
    ));

    for node in device.nodes().iter().filter(|n| n.announced) {
        messages.extend(node_structure(node));
    }

    let node_ids: Vec<&str> = device
        .nodes()
        .iter()
        .filter(|n| n.announced)
        .map(|n| n.id.as_str())
        .collect();
    messages.push(OutboundMessage::structural(
        format!("{}/$nodes", topic),
        node_ids.join(","),
    ));

    messages
}

/// Current values of a node. Presets that never received a value are skipped.
pub fn node_values(node: &Node) -> Vec<OutboundMessage> {
    node.properties
        .iter()
        .filter(|p| p.value.is_some())
        .map(|p| {
            if p.no_retain {
                OutboundMessage::event(p.topic.as_str(), p.payload())
            } else {
                OutboundMessage::runtime(p.topic.as_str(), p.payload())
            }
        })
        .collect()
}

/// Stats block for one heartbeat tick.
pub fn stats(device: &Device, now: &DateTime<Utc>) -> Vec<OutboundMessage> {
    let base = format!("{}/$stats", device.topic());
    let stats = device.stats();

    vec![
        OutboundMessage::structural(base.as_str(), STATS_FIELDS),
        OutboundMessage::runtime(
            format!("{}/interval", base),
            stats.interval_secs.to_string(),
        ),
        OutboundMessage::runtime(
            format!("{}/uptime", base),
            stats.uptime_at(now).to_string(),
        ),
        OutboundMessage::runtime(format!("{}/signal", base), stats.signal.to_string()),
        OutboundMessage::runtime(format!("{}/voltage", base), stats.voltage.to_string()),
        OutboundMessage::runtime(format!("{}/battery", base), stats.battery.to_string()),
        OutboundMessage::runtime(
            format!("{}/firstSeen", base),
            format_timestamp(&stats.first_seen),
        ),
        OutboundMessage::runtime(
            format!("{}/lastSeen", base),
            format_timestamp(&stats.last_seen),
        ),
    ]
}
