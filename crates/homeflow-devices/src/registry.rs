/*!
 * Device registry for HomeFlow.
 *
 * The registry is an append-only arena of devices addressed by
 * [`DeviceId`]. Handles stay valid for the life of the process, which lets
 * devices refer to each other without owning references. Lookups take
 * snapshots under a read lock.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info};

use homeflow_core::types::{DeviceId, Source, State};

use crate::device::{Device, DeviceError, DeviceInfo, Result};

/// Event types for device registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was added to the registry
    DeviceAdded {
        /// The device handle
        id: DeviceId,
        /// The device name
        name: String,
    },
    /// A device committed a transition, which may leave the state unchanged
    Committed {
        /// The device handle
        id: DeviceId,
        /// The state before the commit
        previous: State,
        /// The state after the commit
        state: State,
        /// Whether the state differs from `previous`
        changed: bool,
        /// Who issued the committed command
        source: Source,
    },
}

#[derive(Debug)]
enum Slot {
    /// Name claimed, device still under construction
    Reserved(String),
    /// Construction failed; the handle is never reused
    Abandoned(String),
    Ready(Arc<dyn Device>),
}

#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Slot>,
    names: HashMap<String, DeviceId>,
}

/// Device registry
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Inner>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner::default()),
            event_sender,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| DeviceError::other("Failed to acquire read lock on device registry"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| DeviceError::other("Failed to acquire write lock on device registry"))
    }

    /// Claim a name and allocate its handle
    pub fn reserve(&self, name: &str) -> Result<DeviceId> {
        let mut inner = self.write()?;
        if inner.names.contains_key(name) {
            return Err(DeviceError::AlreadyExists(format!("Device {}", name)));
        }
        let id = DeviceId::from_index(inner.slots.len());
        inner.slots.push(Slot::Reserved(name.to_string()));
        inner.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Install the device built for a reserved handle
    pub fn attach(&self, id: DeviceId, device: Arc<dyn Device>) -> Result<()> {
        let name = {
            let mut inner = self.write()?;
            let slot = inner
                .slots
                .get_mut(id.index())
                .ok_or_else(|| DeviceError::not_found(id.to_string()))?;
            let name = match slot {
                Slot::Reserved(name) => name.clone(),
                Slot::Abandoned(name) => {
                    return Err(DeviceError::not_found(format!("Abandoned device {}", name)))
                }
                Slot::Ready(existing) => {
                    return Err(DeviceError::AlreadyExists(format!(
                        "Device {}",
                        existing.name()
                    )))
                }
            };
            *slot = Slot::Ready(device);
            name
        };

        debug!(device = %name, id = %id, "Registered device");
        let _ = self.event_sender.send(RegistryEvent::DeviceAdded { id, name });
        Ok(())
    }

    /// Give up a reserved handle after a failed construction, freeing the name
    pub fn abandon(&self, id: DeviceId) -> Result<()> {
        let mut inner = self.write()?;
        let Inner { slots, names } = &mut *inner;
        if let Some(slot) = slots.get_mut(id.index()) {
            if let Slot::Reserved(name) = slot {
                names.remove(name.as_str());
                *slot = Slot::Abandoned(std::mem::take(name));
            }
        }
        Ok(())
    }

    /// Reserve a handle, build the device with it and install it
    pub fn register<F>(&self, name: &str, build: F) -> Result<DeviceId>
    where
        F: FnOnce(DeviceId) -> Result<Arc<dyn Device>>,
    {
        let id = self.reserve(name)?;
        match build(id) {
            Ok(device) => {
                self.attach(id, device)?;
                Ok(id)
            }
            Err(e) => {
                self.abandon(id)?;
                Err(e)
            }
        }
    }

    /// Get a device by handle
    pub fn get(&self, id: DeviceId) -> Result<Arc<dyn Device>> {
        let inner = self.read()?;
        match inner.slots.get(id.index()) {
            Some(Slot::Ready(device)) => Ok(device.clone()),
            _ => Err(DeviceError::not_found(id.to_string())),
        }
    }

    /// Look up a handle by device name
    pub fn by_name(&self, name: &str) -> Result<DeviceId> {
        let inner = self.read()?;
        inner
            .names
            .get(name)
            .copied()
            .ok_or_else(|| DeviceError::not_found(format!("Device {}", name)))
    }

    /// Snapshot all installed devices in registration order
    pub fn devices(&self) -> Result<Vec<Arc<dyn Device>>> {
        let inner = self.read()?;
        Ok(inner
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Ready(device) => Some(device.clone()),
                _ => None,
            })
            .collect())
    }

    /// Snapshot the introspection view of every device
    pub fn infos(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices()?.iter().map(|device| device.info()).collect())
    }

    /// Count installed devices
    pub fn len(&self) -> usize {
        self.devices().map(|devices| devices.len()).unwrap_or(0)
    }

    /// Whether no device is installed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Broadcast an event to subscribers; dropped when nobody listens
    pub fn publish(&self, event: RegistryEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Shut down every device
    pub fn shutdown_all(&self) -> Result<()> {
        let devices = self.devices()?;
        for device in &devices {
            debug!(device = %device.name(), "Shutting down device");
            device.shutdown();
        }
        info!("Shut down {} devices", devices.len());
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
