/*!
 * Devices bound to hardware.
 *
 * An [`InterfaceDevice`] is a [`StateDevice`] with a hardware address and
 * an ordered list of drivers. Decoded events for its address come in as
 * commands from the driver; committed transitions go back out to every
 * bound driver except the one that reported them.
 */
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use homeflow_core::types::{Address, Command, DeviceId, DriverId, Source, State};
use homeflow_devices::{CommandContext, Device, DeviceInfo, Driver, EventSink};

use crate::device_config::DeviceConfig;
use crate::error::{Error, Result};
use crate::scheduler::PeriodicTick;
use crate::state_device::{Outcome, StateDevice};

/// Hardware output policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    /// The hardware address
    pub address: Address,
    /// Never write to the hardware
    pub read_only: bool,
    /// Write even when the state did not change
    pub send_always: bool,
    /// Periodically re-assert the state
    pub sync: bool,
}

impl InterfaceSettings {
    /// Create settings for an address with the default policy
    pub fn new(address: Address) -> Self {
        Self {
            address,
            read_only: false,
            send_always: false,
            sync: false,
        }
    }

    /// Take the policy from a device configuration, if it has an address
    pub fn from_config(config: &DeviceConfig) -> Option<Self> {
        Some(Self {
            address: config.address.clone()?,
            read_only: config.read_only,
            send_always: config.send_always,
            sync: config.sync,
        })
    }

    /// Set the read-only flag
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the send-always flag
    pub fn with_send_always(mut self, send_always: bool) -> Self {
        self.send_always = send_always;
        self
    }
}

/// A state device bound to drivers at a hardware address
pub struct InterfaceDevice {
    inner: StateDevice,
    settings: InterfaceSettings,
    drivers: Vec<Arc<dyn Driver>>,
    sync: Mutex<Option<PeriodicTick>>,
}

impl fmt::Debug for InterfaceDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceDevice")
            .field("device", &self.inner)
            .field("address", &self.settings.address)
            .field("drivers", &self.drivers.len())
            .finish()
    }
}

impl InterfaceDevice {
    /// Bind a state device to drivers
    pub fn new(inner: StateDevice, settings: InterfaceSettings, drivers: Vec<Arc<dyn Driver>>) -> Self {
        Self {
            inner,
            settings,
            drivers,
            sync: Mutex::new(None),
        }
    }

    /// The wrapped rule engine
    pub fn state_device(&self) -> &StateDevice {
        &self.inner
    }

    /// The hardware address
    pub fn address(&self) -> &Address {
        &self.settings.address
    }

    /// The output policy
    pub fn settings(&self) -> &InterfaceSettings {
        &self.settings
    }

    /// The bound drivers, in order
    pub fn drivers(&self) -> &[Arc<dyn Driver>] {
        &self.drivers
    }

    /// Subscribe this device to its drivers for events at its address
    pub fn attach_drivers(self: &Arc<Self>) {
        let sink: Weak<dyn EventSink> = Arc::downgrade(self) as Weak<dyn EventSink>;
        for driver in &self.drivers {
            driver.subscribe(sink.clone(), Some(self.settings.address.clone()));
            debug!(device = %self.inner.name(), driver = %driver.name(), "Listening on driver");
        }
    }

    /// Run a command through the pipeline, then drive the hardware
    pub fn process(&self, command: Command, source: &Source, ctx: &CommandContext) -> Outcome {
        let outcome = self.inner.process(command, source, ctx);
        let origin = source.driver();

        match outcome {
            Outcome::Committed(transition) => {
                if transition.changed || self.settings.send_always {
                    self.emit(transition.command, origin);
                }
            }
            Outcome::Status => {
                for driver in self.others(origin) {
                    driver.status(&self.settings.address);
                }
            }
            _ => {}
        }
        outcome
    }

    fn others(&self, origin: Option<DriverId>) -> impl Iterator<Item = &Arc<dyn Driver>> {
        self.drivers
            .iter()
            .filter(move |driver| Some(driver.id()) != origin)
    }

    fn emit(&self, command: Command, origin: Option<DriverId>) {
        if self.settings.read_only {
            trace!(device = %self.inner.name(), command = %command, "Read-only, not sending");
            return;
        }
        for driver in self.others(origin) {
            trace!(device = %self.inner.name(), driver = %driver.name(), command = %command, "Sending");
            driver.send(&self.settings.address, command);
        }
    }

    /// Send the current state to every bound driver
    pub fn resync(&self) {
        let state = self.inner.state();
        match state.as_command() {
            Some(command) if !self.settings.read_only => {
                debug!(device = %self.inner.name(), state = %state, "Re-asserting state");
                for driver in &self.drivers {
                    driver.send(&self.settings.address, command);
                }
            }
            _ => {}
        }
    }

    /// Arm the periodic re-assertion with a period drawn from `min..=max`.
    ///
    /// Does nothing unless sync is enabled and the device may write.
    pub fn start_sync(self: &Arc<Self>, min: Duration, max: Duration) -> Result<Option<Duration>> {
        if !self.settings.sync || self.settings.read_only {
            return Ok(None);
        }
        let (low, high) = (min.as_secs().max(1), max.as_secs().max(1));
        if low > high {
            return Err(Error::configuration(format!(
                "Sync bounds inverted: {}s > {}s",
                low, high
            )));
        }
        let period = Duration::from_secs(rand::thread_rng().gen_range(low..=high));

        let device = Arc::downgrade(self);
        let tick = PeriodicTick::start(self.inner.context().scheduler(), period, move || {
            if let Some(device) = device.upgrade() {
                device.resync();
            }
        })?;

        let mut sync = self
            .sync
            .lock()
            .map_err(|_| Error::other("Failed to acquire sync timer"))?;
        *sync = Some(tick);
        debug!(device = %self.inner.name(), ?period, "Sync timer armed");
        Ok(Some(period))
    }
}

impl Device for InterfaceDevice {
    fn id(&self) -> DeviceId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn state(&self) -> State {
        self.inner.state()
    }

    fn command(&self, command: Command, source: Source, ctx: &CommandContext) {
        self.process(command, &source, ctx);
    }

    fn address_matches(&self, address: &Address) -> bool {
        self.settings.address.matches(address)
    }

    fn subscribe(&self, delegate: DeviceId) {
        self.inner.subscribe(delegate);
    }

    fn unsubscribe(&self, delegate: DeviceId) {
        self.inner.unsubscribe(delegate);
    }

    fn add_producer(&self, producer: DeviceId) {
        self.inner.add_producer(producer);
    }

    fn delegates(&self) -> Vec<DeviceId> {
        self.inner.delegates()
    }

    fn producers(&self) -> Vec<DeviceId> {
        self.inner.producers()
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            address: Some(self.settings.address.clone()),
            ..self.inner.snapshot()
        }
    }

    fn shutdown(&self) {
        self.inner.shutdown();
        match self.sync.lock() {
            Ok(mut sync) => {
                sync.take();
            }
            Err(_) => warn!(device = %self.inner.name(), "Cannot stop sync timer"),
        }
    }
}

impl EventSink for InterfaceDevice {
    fn on_event(&self, command: Command, address: &Address, driver: DriverId) {
        if !self.address_matches(address) {
            return;
        }
        let ctx = self.inner.context().root();
        self.process(command, &Source::Driver(driver), &ctx);
    }
}
