//! Outbound messages queued by a device for the transport.

use std::fmt;

/// QoS used for everything published on the Homie side.
pub const HOMIE_QOS: u8 = 1;

/// What a queued message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Device, node or property metadata and state tokens. Always retained,
    /// logged at info.
    Structural,
    /// Live values and stats. May skip retain, logged at trace.
    Runtime,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structural => write!(f, "structural"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// A message waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub qos: u8,
    pub kind: MessageKind,
}

impl OutboundMessage {
    /// Retained metadata message.
    pub fn structural(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
            qos: HOMIE_QOS,
            kind: MessageKind::Structural,
        }
    }

    /// Retained value message.
    pub fn runtime(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
            qos: HOMIE_QOS,
            kind: MessageKind::Runtime,
        }
    }

    /// Value message that is not retained by the broker.
    pub fn event(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            retain: false,
            ..Self::runtime(topic, payload)
        }
    }

    pub fn is_structural(&self) -> bool {
        self.kind == MessageKind::Structural
    }
}
