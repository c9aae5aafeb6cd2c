// ── Device registry ──
//
// Explicit owner of every known `Device`, keyed by `DeviceId`. A watcher
// task per device mirrors its readiness into the connected set and emits
// `RegistryEvent`s as devices come and go. A device whose transport cannot
// reconnect is dropped once it disconnects.

use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::CoreError;
use crate::stream::EventStream;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Stable identifier of a registered device (the transport's device id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "camelCase")]
pub enum RegistryEvent {
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
    DeviceConnected(DeviceId),
    DeviceDisconnected(DeviceId),
    AvailableDevices(Vec<DeviceId>),
}

struct Entry {
    device: Device,
    watcher: CancellationToken,
}

/// Cheaply cloneable; every clone sees the same devices.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    devices: DashMap<DeviceId, Entry>,
    connected: DashSet<DeviceId>,
    events: broadcast::Sender<RegistryEvent>,
    cancel: CancellationToken,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(RegistryInner {
                devices: DashMap::new(),
                connected: DashSet::new(),
                events,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Register a device and start tracking its readiness. A device already
    /// registered under the same id is replaced.
    pub fn add(&self, device: Device) -> DeviceId {
        let id = DeviceId::from(device.id());
        if self.inner.devices.contains_key(&id) {
            self.remove(&id);
        }

        let watcher = self.inner.cancel.child_token();
        let ready = device.watch_ready();
        self.inner.devices.insert(
            id.clone(),
            Entry {
                device,
                watcher: watcher.clone(),
            },
        );
        info!(device = %id, "device registered");
        self.inner.emit(RegistryEvent::DeviceAdded(id.clone()));
        self.inner.emit(RegistryEvent::AvailableDevices(self.available_devices()));

        tokio::spawn(watch_device(Arc::downgrade(&self.inner), id.clone(), ready, watcher));
        id
    }

    pub fn remove(&self, id: &DeviceId) -> Option<Device> {
        self.inner.remove(id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.inner.devices.get(id).map(|entry| entry.device.clone())
    }

    pub fn device(&self, id: &DeviceId) -> Result<Device, CoreError> {
        self.get(id).ok_or_else(|| CoreError::DeviceNotFound {
            identifier: id.to_string(),
        })
    }

    /// Every registered device, sorted by id.
    pub fn available_devices(&self) -> Vec<DeviceId> {
        self.inner.available_devices()
    }

    /// Registered devices that are ready, sorted by id.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.inner.connected.iter().map(|id| id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.inner.connected.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.devices.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> EventStream<RegistryEvent> {
        EventStream::new(self.inner.events.subscribe())
    }

    /// Stop every watcher. Devices stay registered.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl RegistryInner {
    fn emit(&self, event: RegistryEvent) {
        debug!(?event, "registry event");
        let _ = self.events.send(event);
    }

    fn available_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.devices.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    fn remove(&self, id: &DeviceId) -> Option<Device> {
        let (_, entry) = self.devices.remove(id)?;
        entry.watcher.cancel();
        if self.connected.remove(id).is_some() {
            self.emit(RegistryEvent::DeviceDisconnected(id.clone()));
        }
        info!(device = %id, "device removed");
        self.emit(RegistryEvent::DeviceRemoved(id.clone()));
        self.emit(RegistryEvent::AvailableDevices(self.available_devices()));
        Some(entry.device)
    }

    /// A device that lost its link for good. Returns true if it was dropped.
    fn drop_if_terminal(&self, id: &DeviceId) -> bool {
        let terminal = self.devices.get(id).is_some_and(|entry| !entry.device.can_reconnect());
        if terminal {
            info!(device = %id, "transport cannot reconnect; dropping device");
            self.remove(id);
        }
        terminal
    }

    fn set_connected(&self, id: &DeviceId, ready: bool) {
        if !self.devices.contains_key(id) {
            return;
        }
        if ready {
            if self.connected.insert(id.clone()) {
                info!(device = %id, "device connected");
                self.emit(RegistryEvent::DeviceConnected(id.clone()));
            }
        } else if self.connected.remove(id).is_some() {
            info!(device = %id, "device disconnected");
            self.emit(RegistryEvent::DeviceDisconnected(id.clone()));
        }
    }
}

async fn watch_device(
    registry: Weak<RegistryInner>,
    id: DeviceId,
    mut ready: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let initial = *ready.borrow_and_update();
    if let Some(registry) = registry.upgrade() {
        registry.set_connected(&id, initial);
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = ready.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_ready = *ready.borrow_and_update();
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.set_connected(&id, is_ready);
                if !is_ready && registry.drop_if_terminal(&id) {
                    break;
                }
            }
        }
    }
    debug!(device = %id, "registry watcher exiting");
}
