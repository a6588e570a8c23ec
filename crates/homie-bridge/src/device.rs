//! Device model.
//!
//! One [`Device`] per bridged vendor device: lifecycle state, the ordered
//! node tree, connectivity stats and the command routing table. Mutations
//! never publish anything; they append to the device outbox, which the
//! registry drains into the per-device publisher channel.

use crate::disassembler::{OFF_TOKEN, ON_TOKEN};
use crate::message::OutboundMessage;
use crate::property::{Property, PropertyType, PropertyValue};
use crate::synthesizer;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Homie lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Init,
    Ready,
    Lost,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Ready => write!(f, "ready"),
            Self::Lost => write!(f, "lost"),
        }
    }
}

/// Connectivity statistics published below `$stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStats {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub signal: f64,
    pub voltage: f64,
    pub battery: f64,
    pub interval_secs: u64,
}

impl DeviceStats {
    pub fn new(now: DateTime<Utc>, interval_secs: u64) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            signal: 0.0,
            voltage: 0.0,
            battery: 100.0,
            interval_secs,
        }
    }

    /// Seconds since the device was first seen.
    pub fn uptime_at(&self, now: &DateTime<Utc>) -> u64 {
        (*now - self.first_seen).num_seconds().max(0) as u64
    }

    /// Pick up battery, link quality and voltage readings.
    fn absorb(&mut self, property: &Property) {
        let Some(reading) = property.value.as_ref().and_then(PropertyValue::as_f64) else {
            return;
        };
        match property.name.as_str() {
            "battery" => self.battery = reading,
            "linkquality" => self.signal = reading,
            "voltage" => self.voltage = reading,
            _ => {}
        }
    }
}

/// How a Homie write value is rewritten before it goes to the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTransform {
    Passthrough,
    /// `true` → `ON`, anything else → `OFF`
    Switch,
}

impl ValueTransform {
    pub fn for_property(property: &Property) -> Self {
        match property.kind {
            PropertyType::Boolean => Self::Switch,
            _ => Self::Passthrough,
        }
    }

    pub fn apply(&self, value: &str) -> String {
        match self {
            Self::Passthrough => value.to_string(),
            Self::Switch if value == "true" => ON_TOKEN.to_string(),
            Self::Switch => OFF_TOKEN.to_string(),
        }
    }
}

/// Entry of the command routing table, keyed by Homie write topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRoute {
    pub node_id: String,
    pub vendor_topic: String,
    pub transform: ValueTransform,
}

/// A node of a device.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    /// `<base>/<device>/<node>`
    pub topic: String,
    /// Properties of the latest message, in payload order
    pub properties: Vec<Property>,
    /// Presets announced alongside the inferred properties
    pub custom_properties: Vec<Property>,
    /// Whether the node is part of the published structure
    pub announced: bool,
    /// Every property name that was ever settable, with its command topic
    settable: HashMap<String, Option<String>>,
}

type NodeSignature = (String, Vec<(String, PropertyType, bool, Option<String>)>);

impl Node {
    fn new(id: &str, name: &str, device_topic: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            topic: format!("{}/{}", device_topic, id),
            properties: Vec::new(),
            custom_properties: Vec::new(),
            announced: false,
            settable: HashMap::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.effective_properties()
            .into_iter()
            .find(|p| p.name == name)
    }

    /// Inferred properties followed by every preset they do not shadow.
    pub fn effective_properties(&self) -> Vec<&Property> {
        self.properties
            .iter()
            .chain(
                self.custom_properties
                    .iter()
                    .filter(|c| !self.properties.iter().any(|p| p.name == c.name)),
            )
            .collect()
    }

    /// Everything about the node that appears in its published structure.
    fn signature(&self) -> NodeSignature {
        let properties = self
            .effective_properties()
            .into_iter()
            .map(|p| (p.name.clone(), p.kind, p.settable, p.format.clone()))
            .collect();
        (self.name.clone(), properties)
    }
}

/// What a property builder gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub device_id: &'a str,
    pub node_id: &'a str,
    pub node_topic: &'a str,
}

/// Outcome of merging properties into a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpdate {
    /// Only values changed
    Values,
    /// Node received its first non-empty property set
    Announced,
    /// Structure of an announced node changed
    Restructured,
}

impl NodeUpdate {
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::Values)
    }
}

/// Per-device settings.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Node id prefixes that must all be present before `ready`
    pub required_nodes: Vec<String>,
    pub stats_interval: Duration,
    pub stale_after: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            required_nodes: Vec::new(),
            stats_interval: Duration::from_secs(120),
            stale_after: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// A bridged device.
#[derive(Debug)]
pub struct Device {
    id: String,
    name: String,
    topic: String,
    state: DeviceState,
    nodes: Vec<Node>,
    required_nodes: Vec<String>,
    stats: DeviceStats,
    routes: HashMap<String, CommandRoute>,
    outbox: VecDeque<OutboundMessage>,
    settle_generation: u64,
    pending_settle: Option<u64>,
    stale_after: Duration,
}

impl Device {
    /// Create a device below `base_topic` and queue its `$homie`, `$name`
    /// and `$state = init`.
    pub fn new(
        id: &str,
        name: &str,
        base_topic: &str,
        options: DeviceOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let mut device = Self {
            id: id.to_string(),
            name: name.to_string(),
            topic: format!("{}/{}", base_topic.trim_end_matches('/'), id),
            state: DeviceState::Init,
            nodes: Vec::new(),
            required_nodes: options.required_nodes,
            stats: DeviceStats::new(now, options.stats_interval.as_secs()),
            routes: HashMap::new(),
            outbox: VecDeque::new(),
            settle_generation: 0,
            pending_settle: None,
            stale_after: options.stale_after,
        };
        let info = synthesizer::device_info(&device);
        device.outbox.extend(info);
        info!(device_id = %device.id, topic = %device.topic, "Device created");
        device
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<base>/<device>`
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn required_nodes(&self) -> &[String] {
        &self.required_nodes
    }

    pub fn command_route(&self, write_topic: &str) -> Option<&CommandRoute> {
        self.routes.get(write_topic)
    }

    /// Every required prefix matches at least one announced node.
    pub fn requirements_met(&self) -> bool {
        self.required_nodes.iter().all(|prefix| {
            self.nodes
                .iter()
                .any(|n| n.announced && n.id.starts_with(prefix.as_str()))
        })
    }

    /// Record traffic. Returns whether the device is coming back from
    /// `lost`; the re-announcement happens in the node update that follows
    /// or in [`Device::recover`].
    pub fn touch(&mut self, now: DateTime<Utc>) -> bool {
        self.stats.last_seen = now;
        self.state == DeviceState::Lost
    }

    /// Leave `lost` with a full re-announcement unless a node update already
    /// did. Returns whether an announcement was queued.
    pub fn recover(&mut self) -> bool {
        if self.state != DeviceState::Lost {
            return false;
        }
        info!(device_id = %self.id, "Device seen again after being lost");
        self.announce_structure();
        true
    }

    /// Refine the display name. A change on an announced device is structural.
    pub fn rename(&mut self, name: &str) -> bool {
        if name.is_empty() || self.name == name {
            return false;
        }
        debug!(device_id = %self.id, old = %self.name, new = %name, "Renaming device");
        self.name = name.to_string();
        if self.state == DeviceState::Lost {
            // Announced on recovery
            return true;
        }
        if self.nodes.iter().any(|n| n.announced) {
            self.announce_structure();
        } else {
            self.outbox.push_back(OutboundMessage::structural(
                format!("{}/$name", self.topic),
                self.name.as_str(),
            ));
        }
        true
    }

    /// Replace the properties of `node_id` with what `build` returns,
    /// creating the node on first use.
    ///
    /// Properties keep `settable` once they had it and inherit `noRetain`
    /// and `format` from a same-named preset. A structural change queues the
    /// full structure before the values.
    pub fn find_or_add_node<F>(&mut self, node_id: &str, name: Option<&str>, build: F) -> NodeUpdate
    where
        F: FnOnce(&NodeContext<'_>) -> Vec<Property>,
    {
        let index = self.node_index(node_id, name);
        let before = self.nodes[index].announced.then(|| self.nodes[index].signature());

        let mut fresh = {
            let node = &self.nodes[index];
            build(&NodeContext {
                device_id: &self.id,
                node_id: &node.id,
                node_topic: &node.topic,
            })
        };

        let node = &mut self.nodes[index];
        for property in fresh.iter_mut() {
            if property.settable {
                node.settable
                    .insert(property.name.clone(), property.command_topic.clone());
            } else if let Some(command_topic) = node.settable.get(&property.name) {
                property.settable = true;
                property.command_topic = command_topic.clone();
            }
            if let Some(preset) = node
                .custom_properties
                .iter()
                .find(|c| c.name == property.name)
            {
                property.no_retain |= preset.no_retain;
                if property.format.is_none() {
                    property.format = preset.format.clone();
                }
            }
            self.stats.absorb(property);
        }
        node.properties = fresh;

        let update = self.finish_node_change(index, before, true);
        let values = synthesizer::node_values(&self.nodes[index]);
        self.outbox.extend(values);
        update
    }

    /// Attach presets to `node_id`, creating the node on first use.
    pub fn attach_custom_properties<F>(
        &mut self,
        node_id: &str,
        name: Option<&str>,
        build: F,
    ) -> NodeUpdate
    where
        F: FnOnce(&NodeContext<'_>) -> Vec<Property>,
    {
        let index = self.node_index(node_id, name);
        let before = self.nodes[index].announced.then(|| self.nodes[index].signature());

        let presets = {
            let node = &self.nodes[index];
            build(&NodeContext {
                device_id: &self.id,
                node_id: &node.id,
                node_topic: &node.topic,
            })
        };
        self.nodes[index].custom_properties = presets;

        self.finish_node_change(index, before, false)
    }

    /// Queue the full structure, enter `init` and arm the settle timer when
    /// every required node is present.
    pub fn announce_structure(&mut self) {
        let messages = synthesizer::structure(self);
        self.outbox.extend(messages);

        if self.state != DeviceState::Init {
            info!(device_id = %self.id, from = %self.state, "Device state -> init");
            self.state = DeviceState::Init;
        }

        self.settle_generation += 1;
        self.pending_settle = self.requirements_met().then_some(self.settle_generation);
    }

    /// Settle timer to arm, if any. Cleared on read.
    pub fn take_pending_settle(&mut self) -> Option<u64> {
        self.pending_settle.take()
    }

    /// Settle timer of `generation` elapsed. Only the most recent timer may
    /// move the device to `ready`.
    pub fn complete_settle(&mut self, generation: u64) -> bool {
        if generation != self.settle_generation
            || self.state != DeviceState::Init
            || !self.requirements_met()
        {
            debug!(device_id = %self.id, generation, "Discarding stale settle timer");
            return false;
        }

        self.outbox
            .push_back(synthesizer::state_message(&self.topic, DeviceState::Ready));
        self.state = DeviceState::Ready;
        info!(device_id = %self.id, "Device state -> ready");
        true
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match (now - self.stats.last_seen).to_std() {
            Ok(elapsed) => elapsed > self.stale_after,
            Err(_) => false,
        }
    }

    /// Heartbeat tick: queue the stats block and mark the device lost when
    /// it has been silent for too long. Returns whether it just became lost.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> bool {
        let messages = synthesizer::stats(self, &now);
        self.outbox.extend(messages);

        if self.state == DeviceState::Lost || !self.is_stale(now) {
            return false;
        }

        warn!(
            device_id = %self.id,
            last_seen = %synthesizer::format_timestamp(&self.stats.last_seen),
            "Device state -> lost"
        );
        self.outbox
            .push_back(synthesizer::state_message(&self.topic, DeviceState::Lost));
        self.state = DeviceState::Lost;
        self.settle_generation += 1;
        self.pending_settle = None;
        true
    }

    /// Queue an empty value on a write topic.
    pub fn clear_write(&mut self, write_topic: &str) {
        self.outbox
            .push_back(OutboundMessage::runtime(write_topic, ""));
    }

    /// Drain everything queued since the last call, oldest first.
    pub fn take_outbox(&mut self) -> Vec<OutboundMessage> {
        self.outbox.drain(..).collect()
    }

    fn node_index(&mut self, node_id: &str, name: Option<&str>) -> usize {
        if let Some(index) = self.nodes.iter().position(|n| n.id == node_id) {
            if let Some(name) = name {
                self.nodes[index].name = name.to_string();
            }
            return index;
        }

        debug!(device_id = %self.id, node_id, "Adding node");
        self.nodes
            .push(Node::new(node_id, name.unwrap_or(node_id), &self.topic));
        self.nodes.len() - 1
    }

    /// `traffic` is set when the change comes from the device itself, which
    /// is what brings a lost device back.
    fn finish_node_change(
        &mut self,
        index: usize,
        before: Option<NodeSignature>,
        traffic: bool,
    ) -> NodeUpdate {
        let node = &mut self.nodes[index];
        let update = match before {
            Some(signature) if signature != node.signature() => NodeUpdate::Restructured,
            Some(_) => NodeUpdate::Values,
            None if node.effective_properties().is_empty() => NodeUpdate::Values,
            None => {
                node.announced = true;
                NodeUpdate::Announced
            }
        };

        self.refresh_routes(index);
        if self.state == DeviceState::Lost {
            if traffic && self.nodes[index].announced {
                info!(device_id = %self.id, "Device seen again after being lost");
                self.announce_structure();
            }
        } else if update.is_structural() {
            info!(
                device_id = %self.id,
                node_id = %self.nodes[index].id,
                change = ?update,
                "Node structure changed"
            );
            self.announce_structure();
        }
        update
    }

    fn refresh_routes(&mut self, index: usize) {
        let node = &self.nodes[index];
        self.routes.retain(|_, route| route.node_id != node.id);
        for property in node.effective_properties() {
            let Some(vendor_topic) = property.command_topic.as_ref() else {
                continue;
            };
            if !property.settable {
                continue;
            }
            self.routes.insert(
                property.write_topic(),
                CommandRoute {
                    node_id: node.id.clone(),
                    vendor_topic: vendor_topic.clone(),
                    transform: ValueTransform::for_property(property),
                },
            );
        }
    }
}
