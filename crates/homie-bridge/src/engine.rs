//! Translation and device lifecycle engine.
//!
//! ```text
//! source (base, topic, payload)
//!     │ on_message
//!     ▼
//! VendorProfile ── skip / discover / ids / qualifies
//!     │
//! PayloadDisassembler ── descriptors
//!     │
//! DeviceRegistry → DeviceHandle.with(|device| merge, touch)
//!     │                    │ outbox
//!     │                    ▼
//!     │              publisher task → Transport::publish
//!     ▼
//! settle timer → complete_settle → $state = ready
//!
//! Homie write (…/set) → on_write → router → Transport::publish_command
//! ```

use crate::device::{Device, DeviceOptions, DeviceState};
use crate::disassembler::{DisassemblerConfig, PayloadDisassembler};
use crate::error::{BridgeError, BridgeResult};
use crate::heartbeat::{spawn_heartbeat, BridgeClock, HeartbeatConfig};
use crate::message::OutboundMessage;
use crate::profiles::{DiscoveredDevice, VendorProfile};
use crate::property::{Property, SET_SUFFIX};
use crate::registry::{DeviceHandle, DeviceRegistry, DEFAULT_OUTBOX_DEPTH};
use crate::router::{self, RoutingResult};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the Homie topic tree, without trailing slash
    pub homie_base_topic: String,
    pub disassembler: DisassemblerConfig,
    pub required_nodes: Vec<String>,
    /// Quiet period between the last structural change and `ready`
    pub settle_delay: Duration,
    pub heartbeat: HeartbeatConfig,
    /// Period of the full structure resend, `None` disables it
    pub structure_resend: Option<Duration>,
    pub outbox_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            homie_base_topic: "homie".to_string(),
            disassembler: DisassemblerConfig::default(),
            required_nodes: Vec::new(),
            settle_delay: Duration::from_secs(5),
            heartbeat: HeartbeatConfig::default(),
            structure_resend: Some(Duration::from_secs(300)),
            outbox_depth: DEFAULT_OUTBOX_DEPTH,
        }
    }
}

/// The bridge engine.
pub struct BridgeEngine {
    config: EngineConfig,
    profile: Arc<dyn VendorProfile>,
    disassembler: PayloadDisassembler,
    registry: DeviceRegistry,
    transport: Arc<dyn Transport>,
    clock: BridgeClock,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeEngine {
    pub fn new(
        config: EngineConfig,
        profile: Arc<dyn VendorProfile>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::with_clock(config, profile, transport, BridgeClock::new())
    }

    pub fn with_clock(
        config: EngineConfig,
        profile: Arc<dyn VendorProfile>,
        transport: Arc<dyn Transport>,
        clock: BridgeClock,
    ) -> Arc<Self> {
        info!(
            profile = %profile.kind(),
            transport = transport.name(),
            base_topic = %config.homie_base_topic,
            "Creating bridge engine"
        );
        Arc::new(Self {
            disassembler: PayloadDisassembler::new(config.disassembler.clone()),
            registry: DeviceRegistry::new(config.outbox_depth),
            config,
            profile,
            transport,
            clock,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn profile(&self) -> &Arc<dyn VendorProfile> {
        &self.profile
    }

    /// Start engine-wide background work.
    pub fn start(self: &Arc<Self>) {
        let Some(period) = self.config.structure_resend else {
            return;
        };

        let engine: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await; // Skip first tick

            loop {
                timer.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                info!("Resending the whole Homie structure");
                engine.resend_structure().await;
            }
        });
        self.tasks.lock().push(task);
    }

    /// Handle one vendor message received below `base_topic`.
    pub async fn on_message(
        &self,
        base_topic: &str,
        topic: &str,
        payload: &[u8],
    ) -> BridgeResult<()> {
        let text = String::from_utf8_lossy(payload);

        if let Some(discovered) = self.profile.discover(base_topic, topic, &text) {
            let devices = discovered?;
            info!(topic = %topic, count = devices.len(), "Discovery message received");
            for device in devices {
                self.register_discovered(device).await;
            }
            return Ok(());
        }

        if self.profile.skip_topic(base_topic, topic) {
            debug!(topic = %topic, "Skipping topic");
            return Ok(());
        }

        let device_id = self
            .profile
            .device_id(base_topic, topic)
            .ok_or_else(|| BridgeError::UnknownDevice(topic.to_string()))?;
        let node_id = self.profile.node_id(base_topic, topic);

        let disassembled = self.disassembler.disassemble(payload, &node_id)?;
        let qualified_name = self.profile.qualifies(base_topic, topic, &text);

        let handle = match self.registry.resolve(device_id) {
            Some(handle) => handle,
            None => match qualified_name.as_deref() {
                Some(name) => self.register(device_id, name).await,
                None => return Err(BridgeError::UnknownDevice(device_id.to_string())),
            },
        };

        let command_topic = self.profile.command_topic(base_topic, device_id, &node_id);
        let group = disassembled.group().map(str::to_string);
        let now = self.clock.now();

        let settle = handle
            .with(move |device| {
                device.touch(now);
                if let Some(name) = qualified_name.as_deref() {
                    device.rename(name);
                }
                if !disassembled.is_empty() {
                    device.find_or_add_node(&node_id, group.as_deref(), |ctx| {
                        disassembled
                            .into_properties()
                            .into_iter()
                            .map(|desc| {
                                Property::from_descriptor(
                                    desc,
                                    ctx.node_topic,
                                    command_topic.clone(),
                                )
                            })
                            .collect()
                    });
                }
                device.recover();
                device.take_pending_settle()
            })
            .await;

        if let Some(generation) = settle {
            self.schedule_ready(&handle, generation);
        }
        Ok(())
    }

    /// Handle a Homie write received on `topic`.
    pub async fn on_write(&self, topic: &str, payload: &[u8]) -> BridgeResult<()> {
        if !router::is_write_topic(topic) {
            trace!(topic = %topic, "Not a write topic");
            return Ok(());
        }

        let value = String::from_utf8_lossy(payload);
        let device_id = router::write_topic_device(&self.config.homie_base_topic, topic)
            .ok_or_else(|| BridgeError::Routing(topic.to_string()))?;
        let handle = self
            .registry
            .resolve(device_id)
            .ok_or_else(|| BridgeError::UnknownDevice(device_id.to_string()))?;

        let result = handle.with(|device| router::route(device, topic, &value)).await?;
        match result {
            RoutingResult::Forward {
                vendor_topic,
                payload,
                write_topic,
            } => {
                info!(
                    device_id = %device_id,
                    topic = %write_topic,
                    vendor_topic = %vendor_topic,
                    payload = %payload,
                    "Forwarding Homie write"
                );
                if let Err(e) = self.transport.publish_command(&vendor_topic, &payload).await {
                    warn!(device_id = %device_id, error = %e, "Vendor command failed");
                }
                handle.with(|device| device.clear_write(&write_topic)).await;
            }
            RoutingResult::Ignored(reason) => {
                trace!(topic = %topic, reason, "Write ignored");
            }
        }
        Ok(())
    }

    /// Re-announce every device: `init`, full structure, `ready` after the
    /// settle delay. Lost devices stay lost until they send something.
    pub async fn resend_structure(&self) {
        for handle in self.registry.handles() {
            let settle = handle
                .with(|device| {
                    if device.state() == DeviceState::Lost {
                        trace!(device_id = %device.id(), "Not re-announcing lost device");
                        return None;
                    }
                    device.announce_structure();
                    device.take_pending_settle()
                })
                .await;
            if let Some(generation) = settle {
                self.schedule_ready(&handle, generation);
            }
        }
    }

    /// Stop every timer and publisher and close the transport.
    pub async fn shutdown(&self) {
        info!(devices = self.registry.len(), "Shutting down bridge engine");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.shutdown();
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Transport disconnect failed");
        }
    }

    /// Create a device and its publisher, heartbeat and write subscription.
    async fn register(&self, device_id: &str, name: &str) -> Arc<DeviceHandle> {
        let base = self.config.homie_base_topic.as_str();
        let options = DeviceOptions {
            required_nodes: self.config.required_nodes.clone(),
            stats_interval: self.config.heartbeat.interval_duration(),
            stale_after: self.config.heartbeat.stale_duration(),
        };
        let now = self.clock.now();

        let (handle, receiver) = self
            .registry
            .get_or_create(device_id, || Device::new(device_id, name, base, options, now));
        let Some(receiver) = receiver else {
            return handle;
        };

        let device_topic = format!("{}/{}", base, device_id);
        if let Err(e) = self.transport.register_device(device_id, &device_topic).await {
            error!(device_id = %device_id, error = %e, "Failed to open Homie session");
        }

        handle.attach_task(spawn_publisher(
            self.transport.clone(),
            device_id.to_string(),
            receiver,
        ));
        handle.attach_task(spawn_heartbeat(&handle, &self.config.heartbeat, self.clock));

        let filter = format!("{}/+/+/{}", device_topic, SET_SUFFIX);
        if let Err(e) = self.transport.subscribe(device_id, &filter).await {
            warn!(device_id = %device_id, filter = %filter, error = %e, "Write subscription failed");
        }

        info!(device_id = %device_id, name = %name, "Device registered");
        handle
    }

    async fn register_discovered(&self, discovered: DiscoveredDevice) {
        let handle = match self.registry.resolve(&discovered.id) {
            Some(handle) => handle,
            None => self.register(&discovered.id, &discovered.name).await,
        };

        let DiscoveredDevice {
            name,
            node_id,
            presets,
            ..
        } = discovered;

        let settle = handle
            .with(move |device| {
                device.rename(&name);
                if !presets.is_empty() {
                    device.attach_custom_properties(&node_id, None, |ctx| {
                        presets
                            .into_iter()
                            .map(|desc| Property::from_descriptor(desc, ctx.node_topic, None))
                            .collect()
                    });
                }
                device.take_pending_settle()
            })
            .await;

        if let Some(generation) = settle {
            self.schedule_ready(&handle, generation);
        }
    }

    /// Arm the settle timer of `generation`.
    fn schedule_ready(&self, handle: &Arc<DeviceHandle>, generation: u64) {
        let delay = self.config.settle_delay;
        let device = handle.clone();
        trace!(device_id = %handle.id(), generation, "Arming settle timer");

        handle.attach_task(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            device.with(|d| d.complete_settle(generation)).await;
        }));
    }
}

/// Log an engine error at the level its kind deserves.
pub fn report_error(topic: &str, err: &BridgeError) {
    match err {
        BridgeError::UnknownDevice(device) => {
            debug!(topic = %topic, device = %device, "Waiting for a qualifying message")
        }
        BridgeError::Parse(_) | BridgeError::Routing(_) => {
            warn!(topic = %topic, error = %err, "Message dropped")
        }
        _ => error!(topic = %topic, error = %err, "Message handling failed"),
    }
}

/// Consume one device's outbound channel, in order.
fn spawn_publisher(
    transport: Arc<dyn Transport>,
    device_id: String,
    mut receiver: mpsc::Receiver<OutboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if message.is_structural() {
                info!(device_id = %device_id, topic = %message.topic, payload = %message.payload, "Publishing");
            } else {
                trace!(device_id = %device_id, topic = %message.topic, payload = %message.payload, retain = message.retain, "Publishing");
            }

            if let Err(e) = transport.publish(&device_id, &message).await {
                warn!(device_id = %device_id, error = %e, "Publish failed");
            }
        }
        debug!(device_id = %device_id, "Publisher stopped");
    })
}
