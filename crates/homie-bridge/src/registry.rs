//! Device registry.
//!
//! Owns every [`Device`] behind a [`DeviceHandle`]. Each handle serializes
//! access to its device with an async mutex and forwards the device outbox
//! into a bounded channel, so messages of one device reach the transport in
//! the order they were queued.
//!
//! ```text
//! DeviceRegistry
//!   └── "dev1" → DeviceHandle { Mutex<Device>, Sender<OutboundMessage>, tasks }
//!                                    │ with(|d| ...) drains outbox
//!                                    ▼
//!                               publisher task → Transport
//! ```

use crate::device::Device;
use crate::message::OutboundMessage;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex as TaskList;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default capacity of the per-device outbound channel.
pub const DEFAULT_OUTBOX_DEPTH: usize = 1000;

/// Shared handle to one device.
pub struct DeviceHandle {
    id: String,
    device: Mutex<Device>,
    outbound: mpsc::Sender<OutboundMessage>,
    tasks: TaskList<Vec<JoinHandle<()>>>,
}

impl DeviceHandle {
    fn new(device: Device, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id: device.id().to_string(),
            device: Mutex::new(device),
            outbound,
            tasks: TaskList::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run `f` with exclusive access to the device, then hand everything it
    /// queued to the publisher. The lock is held until the outbox is drained.
    ///
    /// Never waits on the publisher: when the channel is full the message is
    /// dropped and logged.
    pub async fn with<R>(&self, f: impl FnOnce(&mut Device) -> R) -> R {
        let mut device = self.device.lock().await;
        let result = f(&mut *device);

        let mut dropped = 0usize;
        for message in device.take_outbox() {
            match self.outbound.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    dropped += 1;
                    debug!(device_id = %self.id, topic = %message.topic, "Outbox full, message dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(device_id = %self.id, "Publisher gone, dropping outbound messages");
                    break;
                }
            }
        }
        if dropped > 0 {
            warn!(device_id = %self.id, dropped, "Publisher is stalled, outbound messages dropped");
        }
        result
    }

    /// Keep a background task tied to this device's lifetime.
    pub fn attach_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Stop every attached task.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        debug!(device_id = %self.id, count = tasks.len(), "Stopping device tasks");
        for task in tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle").field("id", &self.id).finish()
    }
}

/// Registry of all bridged devices.
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<DeviceHandle>>,
    outbox_depth: usize,
}

impl DeviceRegistry {
    pub fn new(outbox_depth: usize) -> Self {
        Self {
            devices: DashMap::new(),
            outbox_depth: outbox_depth.max(1),
        }
    }

    pub fn resolve(&self, device_id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    /// Look up `device_id`, creating it with `create` when absent.
    ///
    /// The receiver is returned only for a freshly created device; the caller
    /// owns the publisher that consumes it.
    pub fn get_or_create<F>(
        &self,
        device_id: &str,
        create: F,
    ) -> (Arc<DeviceHandle>, Option<mpsc::Receiver<OutboundMessage>>)
    where
        F: FnOnce() -> Device,
    {
        match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), None),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(self.outbox_depth);
                let handle = Arc::new(DeviceHandle::new(create(), tx));
                entry.insert(handle.clone());
                (handle, Some(rx))
            }
        }
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|e| e.key().clone()).collect()
    }

    pub fn handles(&self) -> Vec<Arc<DeviceHandle>> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Stop all device tasks and forget every device.
    pub fn shutdown(&self) {
        for handle in self.handles() {
            handle.shutdown();
        }
        self.devices.clear();
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_DEPTH)
    }
}
