//! Transport interface.
//!
//! The engine talks to the Homie broker and to the vendor command side only
//! through [`Transport`]. The MQTT implementation lives in [`crate::mqtt`];
//! [`MemoryTransport`] records every call for tests and dry runs.

use crate::error::{BridgeError, BridgeResult};
use crate::message::OutboundMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Payload of the last will registered for every device.
pub const LAST_WILL_PAYLOAD: &str = "lost";

/// Outbound side of the bridge.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Open the Homie session of a device. The session carries the last will
    /// `<device_topic>/$state = lost`, retained.
    async fn register_device(&self, device_id: &str, device_topic: &str) -> BridgeResult<()>;

    /// Subscribe the device session to `filter`.
    async fn subscribe(&self, device_id: &str, filter: &str) -> BridgeResult<()>;

    /// Publish a Homie message on the device session.
    async fn publish(&self, device_id: &str, message: &OutboundMessage) -> BridgeResult<()>;

    /// Publish a vendor command.
    async fn publish_command(&self, topic: &str, payload: &str) -> BridgeResult<()>;

    /// Close every session.
    async fn disconnect(&self) -> BridgeResult<()> {
        Ok(())
    }
}

/// Something a [`MemoryTransport`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Registered {
        device_id: String,
        will_topic: String,
    },
    Subscribed {
        device_id: String,
        filter: String,
    },
    Published {
        device_id: String,
        message: OutboundMessage,
    },
    Command {
        topic: String,
        payload: String,
    },
}

/// In-memory transport that records every call.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    events: Mutex<Vec<TransportEvent>>,
    fail_publishes: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent Homie publish fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    /// Homie messages in publish order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Published { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Payloads published on `topic`, oldest first.
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload)
            .collect()
    }

    /// Vendor commands as `(topic, payload)`.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Command { topic, payload } => {
                    Some((topic.clone(), payload.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Subscribed { device_id, filter } => {
                    Some((device_id.clone(), filter.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn register_device(&self, device_id: &str, device_topic: &str) -> BridgeResult<()> {
        self.events.lock().push(TransportEvent::Registered {
            device_id: device_id.to_string(),
            will_topic: format!("{}/$state", device_topic),
        });
        Ok(())
    }

    async fn subscribe(&self, device_id: &str, filter: &str) -> BridgeResult<()> {
        self.events.lock().push(TransportEvent::Subscribed {
            device_id: device_id.to_string(),
            filter: filter.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, device_id: &str, message: &OutboundMessage) -> BridgeResult<()> {
        if self.fail_publishes.load(Ordering::Relaxed) {
            return Err(BridgeError::publish(&message.topic, "publishing disabled"));
        }
        self.events.lock().push(TransportEvent::Published {
            device_id: device_id.to_string(),
            message: message.clone(),
        });
        Ok(())
    }

    async fn publish_command(&self, topic: &str, payload: &str) -> BridgeResult<()> {
        self.events.lock().push(TransportEvent::Command {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_records_calls() {
        let transport = MemoryTransport::new();
        transport.register_device("dev1", "homie/dev1").await.unwrap();
        transport
            .subscribe("dev1", "homie/dev1/+/+/set")
            .await
            .unwrap();
        transport
            .publish("dev1", &OutboundMessage::structural("homie/dev1/$homie", "3.0"))
            .await
            .unwrap();
        transport.publish_command("cmnd/dev1/POWER", "ON").await.unwrap();

        assert_eq!(transport.events().len(), 4);
        assert_eq!(transport.payloads("homie/dev1/$homie"), vec!["3.0"]);
        assert_eq!(
            transport.commands(),
            vec![("cmnd/dev1/POWER".to_string(), "ON".to_string())]
        );
        assert_eq!(
            transport.subscriptions(),
            vec![("dev1".to_string(), "homie/dev1/+/+/set".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failing_publish() {
        let transport = MemoryTransport::new();
        transport.fail_publishes(true);
        let err = transport
            .publish("dev1", &OutboundMessage::runtime("homie/dev1/n/p", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Publish { .. }));
        assert!(transport.published().is_empty());
    }
}
