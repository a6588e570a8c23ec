//! Zigbee2MQTT topic layout.
//!
//! Every device publishes one JSON object on `<base>/<friendly name>`; there
//! is no sub-addressing, so all properties land in the [`SINGLE_NODE_ID`]
//! node. The bridge publishes its device list on
//! `<base>/bridge/config/devices`, which registers devices ahead of their
//! first report and attaches model presets.

use super::{sub_topics, DiscoveredDevice, ProfileKind, VendorProfile, SINGLE_NODE_ID};
use crate::disassembler::looks_like_json;
use crate::error::{BridgeError, BridgeResult};
use crate::property::{PropertyDescriptor, PropertyType};
use serde::Deserialize;

const BRIDGE_SEGMENT: &str = "bridge";
const DEVICE_LIST_SUFFIX: &str = "bridge/config/devices";
const COORDINATOR: &str = "Coordinator";

/// One entry of the bridge device list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zigbee2MqttDeviceInfo {
    #[serde(rename = "friendly_name")]
    pub friendly_name: String,
    #[serde(default)]
    pub ieee_addr: Option<String>,
    #[serde(default, rename = "type")]
    pub device_type: Option<String>,
    #[serde(default, rename = "modelID")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
}

/// Presets of known device models.
pub fn model_presets(model_id: &str) -> Vec<PropertyDescriptor> {
    match model_id {
        "lumi.sensor_switch" => vec![
            PropertyDescriptor::preset("battery", PropertyType::Float),
            PropertyDescriptor::preset("voltage", PropertyType::Float),
            PropertyDescriptor::preset("linkquality", PropertyType::Float),
            PropertyDescriptor::preset("click", PropertyType::String).no_retain(),
            PropertyDescriptor::preset("action", PropertyType::String).no_retain(),
            PropertyDescriptor::preset("duration", PropertyType::Float).no_retain(),
        ],
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Zigbee2MqttProfile;

impl VendorProfile for Zigbee2MqttProfile {
    fn kind(&self) -> ProfileKind {
        ProfileKind::Zigbee2mqtt
    }

    fn default_base_topics(&self) -> Vec<String> {
        vec!["zigbee2mqtt/#".to_string()]
    }

    fn default_required_nodes(&self) -> Vec<String> {
        Vec::new()
    }

    fn skip_topic(&self, base_topic: &str, topic: &str) -> bool {
        sub_topics(base_topic, topic).first() == Some(&BRIDGE_SEGMENT)
    }

    fn node_id(&self, _base_topic: &str, _topic: &str) -> String {
        SINGLE_NODE_ID.to_string()
    }

    fn qualifies(&self, base_topic: &str, topic: &str, payload: &str) -> Option<String> {
        if !looks_like_json(payload) || self.skip_topic(base_topic, topic) {
            return None;
        }
        self.device_id(base_topic, topic).map(str::to_string)
    }

    fn command_topic(&self, base_topic: &str, device_id: &str, _node_id: &str) -> Option<String> {
        Some(format!("{}{}/set", base_topic.trim_end_matches('#'), device_id))
    }

    fn discover(
        &self,
        _base_topic: &str,
        topic: &str,
        payload: &str,
    ) -> Option<BridgeResult<Vec<DiscoveredDevice>>> {
        if !topic.ends_with(DEVICE_LIST_SUFFIX) {
            return None;
        }

        let devices: Vec<Zigbee2MqttDeviceInfo> = match serde_json::from_str(payload) {
            Ok(devices) => devices,
            Err(e) => {
                return Some(Err(BridgeError::Parse(format!(
                    "{} ({})",
                    e, DEVICE_LIST_SUFFIX
                ))))
            }
        };

        Some(Ok(devices
            .into_iter()
            .filter(|d| d.device_type.as_deref() != Some(COORDINATOR))
            .map(|d| DiscoveredDevice {
                presets: d.model_id.as_deref().map(model_presets).unwrap_or_default(),
                id: d.friendly_name.clone(),
                name: d.friendly_name,
                node_id: SINGLE_NODE_ID.to_string(),
            })
            .collect()))
    }
}
