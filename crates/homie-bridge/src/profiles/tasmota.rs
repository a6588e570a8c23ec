//! Tasmota topic layout.
//!
//! ```text
//! tele/<dev>/STATE    periodic state
//! tele/<dev>/SENSOR   sensor readings
//! stat/<dev>/STATUS   status reply, creates the device
//! stat/<dev>/POWER2   switch state
//! cmnd/<dev>/<node>   command topic
//! ```

use super::{sub_topics, ProfileKind, VendorProfile, SINGLE_NODE_ID};
use crate::disassembler::looks_like_json;
use serde_json::Value;

const STATUS: &str = "STATUS";
const RESULT: &str = "RESULT";

#[derive(Debug, Clone, Copy, Default)]
pub struct TasmotaProfile;

impl TasmotaProfile {
    /// `Status.FriendlyName` when it holds exactly one entry.
    fn friendly_name(payload: &str) -> Option<String> {
        let json: Value = serde_json::from_str(payload).ok()?;
        match json.pointer("/Status/FriendlyName")? {
            Value::Array(names) if names.len() == 1 => names[0].as_str().map(str::to_string),
            _ => None,
        }
    }
}

impl VendorProfile for TasmotaProfile {
    fn kind(&self) -> ProfileKind {
        ProfileKind::Tasmota
    }

    fn default_base_topics(&self) -> Vec<String> {
        vec!["tele/#".to_string(), "stat/#".to_string()]
    }

    fn default_required_nodes(&self) -> Vec<String> {
        vec![STATUS.to_string(), "POWER".to_string()]
    }

    /// `STATUS5`, `STATUS11` and friends repeat the status reply piecewise,
    /// `RESULT` echoes commands.
    fn skip_topic(&self, _base_topic: &str, topic: &str) -> bool {
        (topic.contains(STATUS) && !topic.ends_with(STATUS)) || topic.ends_with(RESULT)
    }

    fn node_id(&self, base_topic: &str, topic: &str) -> String {
        sub_topics(base_topic, topic)
            .get(1)
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
            .unwrap_or_else(|| SINGLE_NODE_ID.to_string())
    }

    fn qualifies(&self, base_topic: &str, topic: &str, payload: &str) -> Option<String> {
        if !(topic.starts_with("stat/") && topic.ends_with(STATUS) && looks_like_json(payload)) {
            return None;
        }
        let device_id = self.device_id(base_topic, topic)?;
        Some(Self::friendly_name(payload).unwrap_or_else(|| device_id.to_string()))
    }

    fn command_topic(&self, _base_topic: &str, device_id: &str, node_id: &str) -> Option<String> {
        Some(format!("cmnd/{}/{}", device_id, node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_PAYLOAD: &str =
        r#"{"Status":{"Module":1,"FriendlyName":["Kitchen Lamp"],"Topic":"lamp"}}"#;

    #[test]
    fn test_skip_topics() {
        let p = TasmotaProfile;
        assert!(p.skip_topic("stat/#", "stat/dev1/STATUS5"));
        assert!(p.skip_topic("stat/#", "stat/dev1/RESULT"));
        assert!(!p.skip_topic("stat/#", "stat/dev1/STATUS"));
        assert!(!p.skip_topic("tele/#", "tele/dev1/SENSOR"));
    }

    #[test]
    fn test_ids() {
        let p = TasmotaProfile;
        assert_eq!(p.device_id("tele/#", "tele/dev1/SENSOR"), Some("dev1"));
        assert_eq!(p.node_id("tele/#", "tele/dev1/SENSOR"), "SENSOR");
        assert_eq!(p.node_id("tele/#", "tele/dev1"), SINGLE_NODE_ID);
        assert_eq!(
            p.command_topic("stat/#", "dev1", "POWER2").as_deref(),
            Some("cmnd/dev1/POWER2")
        );
    }

    #[test]
    fn test_status_qualifies_with_friendly_name() {
        let p = TasmotaProfile;
        assert_eq!(
            p.qualifies("stat/#", "stat/lamp/STATUS", STATUS_PAYLOAD),
            Some("Kitchen Lamp".to_string())
        );

        let two_names = r#"{"Status":{"FriendlyName":["A","B"]}}"#;
        assert_eq!(
            p.qualifies("stat/#", "stat/lamp/STATUS", two_names),
            Some("lamp".to_string())
        );
    }

    #[test]
    fn test_other_messages_do_not_qualify() {
        let p = TasmotaProfile;
        assert_eq!(p.qualifies("tele/#", "tele/lamp/STATE", r#"{"POWER":"ON"}"#), None);
        assert_eq!(p.qualifies("stat/#", "stat/lamp/STATUS", "online"), None);
        assert_eq!(p.qualifies("stat/#", "stat/lamp/POWER", "ON"), None);
    }
}
