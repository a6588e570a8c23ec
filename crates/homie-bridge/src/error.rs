//! Error types for the bridge.
//!
//! None of these are fatal to the process: the engine logs them and keeps
//! serving every other device.

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Error type for bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Payload looked like JSON but could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Message references a device that has not been discovered yet
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The transport rejected a publish
    #[error("Publish error on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    /// Write on a topic with no command mapping
    #[error("No command route for {0}")]
    Routing(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection or subscription failure in the transport layer
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BridgeError {
    /// Build a publish error for `topic`.
    pub fn publish(topic: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Publish {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(e: toml::de::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}
