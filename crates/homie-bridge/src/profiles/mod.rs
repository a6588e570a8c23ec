//! Vendor profiles.
//!
//! A profile knows the topic layout of one firmware family: which topics to
//! ignore, how device and node ids are addressed, which messages may create
//! a device, where commands go and whether the vendor publishes an explicit
//! device list.

pub mod tasmota;
pub mod zigbee2mqtt;

pub use tasmota::TasmotaProfile;
pub use zigbee2mqtt::Zigbee2MqttProfile;

use crate::error::BridgeResult;
use crate::property::PropertyDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Node id used when a vendor has no sub-addressing below the device.
pub const SINGLE_NODE_ID: &str = "main";

/// Device announced by an explicit discovery message.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub node_id: String,
    /// Presets attached to the node as custom properties
    pub presets: Vec<PropertyDescriptor>,
}

/// Topic conventions of one vendor.
pub trait VendorProfile: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProfileKind;

    /// Source subscriptions used when none are configured.
    fn default_base_topics(&self) -> Vec<String>;

    /// Node prefixes a device needs before it may become ready.
    fn default_required_nodes(&self) -> Vec<String>;

    /// Topics that are never turned into properties.
    fn skip_topic(&self, base_topic: &str, topic: &str) -> bool;

    fn device_id<'a>(&self, base_topic: &str, topic: &'a str) -> Option<&'a str> {
        sub_topics(base_topic, topic)
            .first()
            .copied()
            .filter(|id| !id.is_empty())
    }

    fn node_id(&self, base_topic: &str, topic: &str) -> String;

    /// Display name for a device this message may create, `None` when the
    /// message does not qualify.
    fn qualifies(&self, base_topic: &str, topic: &str, payload: &str) -> Option<String>;

    /// Vendor topic that receives writes to settable properties of a node.
    fn command_topic(&self, base_topic: &str, device_id: &str, node_id: &str) -> Option<String>;

    /// Devices listed by an explicit discovery message. `None` for any other
    /// topic.
    fn discover(
        &self,
        _base_topic: &str,
        _topic: &str,
        _payload: &str,
    ) -> Option<BridgeResult<Vec<DiscoveredDevice>>> {
        None
    }
}

/// Supported vendor profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    #[default]
    Tasmota,
    Zigbee2mqtt,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tasmota => write!(f, "tasmota"),
            Self::Zigbee2mqtt => write!(f, "zigbee2mqtt"),
        }
    }
}

/// Instantiate the profile of `kind`.
pub fn create_profile(kind: ProfileKind) -> Arc<dyn VendorProfile> {
    match kind {
        ProfileKind::Tasmota => Arc::new(TasmotaProfile),
        ProfileKind::Zigbee2mqtt => Arc::new(Zigbee2MqttProfile),
    }
}

/// Topic segments below a base subscription: `tele/#` + `tele/dev1/STATE`
/// → `["dev1", "STATE"]`.
pub fn sub_topics<'a>(base_topic: &str, topic: &'a str) -> Vec<&'a str> {
    let base = base_topic.trim_end_matches('#');
    topic.strip_prefix(base).unwrap_or(topic).split('/').collect()
}

/// Base subscription that covers `topic`, if any.
pub fn matching_base<'a>(base_topics: &'a [String], topic: &str) -> Option<&'a str> {
    base_topics
        .iter()
        .map(String::as_str)
        .find(|base| topic.starts_with(base.trim_end_matches('#')))
}
