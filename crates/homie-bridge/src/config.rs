//! Bridge configuration.
//!
//! Loaded from a TOML file. Every field has a default, so an empty file
//! bridges a local Tasmota installation to a local broker.
//!
//! ```toml
//! [homie]
//! broker = "192.168.0.45"
//! base_topic = "homie"
//!
//! [source]
//! profile = "tasmota"
//! base_topics = ["tele/#", "stat/#"]
//!
//! [engine]
//! settle_delay_secs = 5
//!
//! [[init_messages]]
//! topic = "cmnd/tasmotas/STATUS"
//! payload = ""
//! ```

use crate::disassembler::DisassemblerConfig;
use crate::engine::EngineConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::heartbeat::HeartbeatConfig;
use crate::profiles::{create_profile, ProfileKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable that overrides both broker passwords.
pub const PASSWORD_ENV: &str = "HOMIE_BRIDGE_MQTT_PASSWORD";

/// Connection settings of one MQTT broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttBrokerConfig {
    /// MQTT broker address
    #[serde(default = "default_broker")]
    pub broker: String,

    /// MQTT broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

fn default_broker() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    60
}

impl MqttBrokerConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn full_broker_addr(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

impl Default for MqttBrokerConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_port(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
        }
    }
}

/// `[homie]`: the broker devices are published to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomieConfig {
    #[serde(flatten)]
    pub mqtt: MqttBrokerConfig,

    /// Root of the Homie topic tree
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

fn default_base_topic() -> String {
    "homie".to_string()
}

impl Default for HomieConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttBrokerConfig::default(),
            base_topic: default_base_topic(),
        }
    }
}

/// `[source]`: the broker the vendor devices publish on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Broker address, the Homie broker when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default)]
    pub profile: ProfileKind,

    /// Subscriptions, the profile defaults when empty
    #[serde(default)]
    pub base_topics: Vec<String>,
}

impl SourceConfig {
    /// Broker settings, falling back to `homie` for anything unset.
    pub fn broker_config(&self, homie: &MqttBrokerConfig) -> MqttBrokerConfig {
        if self.broker.is_none() && self.port.is_none() && self.username.is_none() {
            return homie.clone();
        }
        MqttBrokerConfig {
            broker: self.broker.clone().unwrap_or_else(|| homie.broker.clone()),
            port: self.port.unwrap_or(homie.port),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: homie.keep_alive,
        }
    }
}

/// `[engine]`: translation and lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Node id prefixes required before `ready`, the profile defaults when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_nodes: Option<Vec<String>>,

    #[serde(default = "default_array_flatten_classes")]
    pub array_flatten_classes: Vec<String>,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,

    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Full structure resend period, `0` disables it
    #[serde(default = "default_structure_resend_secs")]
    pub structure_resend_secs: u64,

    #[serde(default = "default_outbox_depth")]
    pub outbox_depth: usize,
}

fn default_array_flatten_classes() -> Vec<String> {
    DisassemblerConfig::default().array_flatten_classes
}
fn default_max_depth() -> usize {
    DisassemblerConfig::default().max_depth
}
fn default_settle_delay_secs() -> u64 {
    5
}
fn default_stats_interval_secs() -> u64 {
    120
}
fn default_stale_after_secs() -> u64 {
    6 * 60 * 60
}
fn default_structure_resend_secs() -> u64 {
    5 * 60
}
fn default_outbox_depth() -> usize {
    crate::registry::DEFAULT_OUTBOX_DEPTH
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            required_nodes: None,
            array_flatten_classes: default_array_flatten_classes(),
            max_depth: default_max_depth(),
            settle_delay_secs: default_settle_delay_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            structure_resend_secs: default_structure_resend_secs(),
            outbox_depth: default_outbox_depth(),
        }
    }
}

/// A message sent to the vendor side on connect or periodically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorMessage {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
}

/// Complete bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub homie: HomieConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub engine: EngineSettings,

    /// Sent once after the source connection is up
    #[serde(default)]
    pub init_messages: Vec<VendorMessage>,

    /// Sent every `periodic_interval_secs`
    #[serde(default)]
    pub periodic_messages: Vec<VendorMessage>,

    #[serde(default = "default_periodic_interval_secs")]
    pub periodic_interval_secs: u64,
}

fn default_periodic_interval_secs() -> u64 {
    5 * 60
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            homie: HomieConfig::default(),
            source: SourceConfig::default(),
            engine: EngineSettings::default(),
            init_messages: Vec::new(),
            periodic_messages: Vec::new(),
            periodic_interval_secs: default_periodic_interval_secs(),
        }
    }
}

impl BridgeConfig {
    /// Read, apply environment overrides and validate.
    pub fn from_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        info!(category = "config", path = %path.display(), "Loading config");

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml_str(content: &str) -> BridgeResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            info!(category = "config", "Broker password taken from {}", PASSWORD_ENV);
            self.homie.mqtt.password = Some(password.clone());
            self.source.password = Some(password);
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.homie.base_topic.trim_matches('/').is_empty() {
            return Err(BridgeError::Configuration(
                "homie.base_topic must not be empty".into(),
            ));
        }
        if self.homie.base_topic.contains(['#', '+']) {
            return Err(BridgeError::Configuration(
                "homie.base_topic must not contain wildcards".into(),
            ));
        }
        if self.base_topics().iter().any(|t| t.trim().is_empty()) || self.base_topics().is_empty() {
            return Err(BridgeError::Configuration(
                "source.base_topics must not be empty".into(),
            ));
        }

        let intervals = [
            ("engine.stats_interval_secs", self.engine.stats_interval_secs),
            ("engine.stale_after_secs", self.engine.stale_after_secs),
            ("periodic_interval_secs", self.periodic_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(BridgeError::Configuration(format!("{} must be > 0", name)));
        }
        if self.engine.outbox_depth == 0 {
            return Err(BridgeError::Configuration(
                "engine.outbox_depth must be > 0".into(),
            ));
        }
        if let Some(message) = self
            .init_messages
            .iter()
            .chain(&self.periodic_messages)
            .find(|m| m.topic.is_empty() || m.topic.contains(['#', '+']))
        {
            return Err(BridgeError::Configuration(format!(
                "invalid vendor message topic '{}'",
                message.topic
            )));
        }
        Ok(())
    }

    /// Source subscriptions.
    pub fn base_topics(&self) -> Vec<String> {
        if self.source.base_topics.is_empty() {
            create_profile(self.source.profile).default_base_topics()
        } else {
            self.source.base_topics.clone()
        }
    }

    pub fn required_nodes(&self) -> Vec<String> {
        self.engine
            .required_nodes
            .clone()
            .unwrap_or_else(|| create_profile(self.source.profile).default_required_nodes())
    }

    pub fn source_broker(&self) -> MqttBrokerConfig {
        self.source.broker_config(&self.homie.mqtt)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            homie_base_topic: self.homie.base_topic.trim_end_matches('/').to_string(),
            disassembler: DisassemblerConfig {
                array_flatten_classes: self.engine.array_flatten_classes.clone(),
                max_depth: self.engine.max_depth,
            },
            required_nodes: self.required_nodes(),
            settle_delay: Duration::from_secs(self.engine.settle_delay_secs),
            heartbeat: HeartbeatConfig::new(
                self.engine.stats_interval_secs,
                self.engine.stale_after_secs,
            ),
            structure_resend: (self.engine.structure_resend_secs > 0)
                .then(|| Duration::from_secs(self.engine.structure_resend_secs)),
            outbox_depth: self.engine.outbox_depth,
        }
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }
}
