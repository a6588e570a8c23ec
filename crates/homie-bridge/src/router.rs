//! Command router: Homie writes back to vendor command topics.

use crate::device::Device;
use crate::error::{BridgeError, BridgeResult};
use crate::property::SET_SUFFIX;

/// What to do with a Homie write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingResult {
    /// Publish `payload` on `vendor_topic`, then clear `write_topic`
    Forward {
        vendor_topic: String,
        payload: String,
        write_topic: String,
    },
    /// Nothing to do
    Ignored(&'static str),
}

/// Whether `topic` is a Homie write channel (`<base>/<dev>/<node>/<prop>/set`).
pub fn is_write_topic(topic: &str) -> bool {
    topic
        .rsplit_once('/')
        .is_some_and(|(_, last)| last == SET_SUFFIX)
}

/// Device id of a write topic below `base_topic`.
pub fn write_topic_device<'a>(base_topic: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(base_topic.trim_end_matches('/'))?;
    rest.strip_prefix('/')?.split('/').next().filter(|s| !s.is_empty())
}

/// Resolve a write on `write_topic` against the device routing table.
pub fn route(device: &Device, write_topic: &str, value: &str) -> BridgeResult<RoutingResult> {
    if value.is_empty() {
        return Ok(RoutingResult::Ignored("empty write value"));
    }

    let route = device
        .command_route(write_topic)
        .filter(|r| !r.vendor_topic.is_empty())
        .ok_or_else(|| BridgeError::Routing(write_topic.to_string()))?;

    Ok(RoutingResult::Forward {
        vendor_topic: route.vendor_topic.clone(),
        payload: route.transform.apply(value),
        write_topic: write_topic.to_string(),
    })
}
