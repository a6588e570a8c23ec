//! Vendor MQTT to Homie bridge
//!
//! Listens to devices speaking a vendor topic layout (Tasmota, Zigbee2MQTT)
//! and republishes each of them as a Homie 3.0 device, including the write
//! path back to the vendor command topics.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | rumqttc source listener and Homie sessions |
//!
//! ## Architecture
//!
//! - **VendorProfile**: topic layout of one vendor ecosystem
//! - **PayloadDisassembler**: turns a payload into property descriptors
//! - **Device / DeviceRegistry**: the Homie model and its lifecycle
//! - **synthesizer**: Homie topics and payloads for a device
//! - **BridgeEngine**: ties the above together, settles `ready`, routes writes
//! - **Transport**: where Homie messages and vendor commands go

pub mod config;
pub mod device;
pub mod disassembler;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod profiles;
pub mod property;
pub mod registry;
pub mod router;
pub mod synthesizer;
pub mod transport;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use config::{BridgeConfig, EngineSettings, HomieConfig, MqttBrokerConfig, SourceConfig};
pub use device::{Device, DeviceState, Node};
pub use disassembler::{Disassembled, DisassemblerConfig, PayloadDisassembler};
pub use engine::{BridgeEngine, EngineConfig};
pub use error::{BridgeError, BridgeResult};
pub use message::OutboundMessage;
pub use profiles::{create_profile, ProfileKind, VendorProfile};
pub use property::{Property, PropertyDescriptor, PropertyType, PropertyValue};
pub use transport::{MemoryTransport, Transport};

#[cfg(feature = "mqtt")]
pub use mqtt::MqttBridge;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
