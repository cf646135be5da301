/*!
 * The engine: owner of the registry, the drivers and the timer services.
 *
 * Devices are built from [`DeviceConfig`] in order. Names used by a
 * configuration (producers, restriction devices, rule sources, drivers)
 * must refer to devices built earlier or drivers registered beforehand.
 */
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use homeflow_core::config::{Config, EngineConfig, SharedConfig};
use homeflow_core::time::{SharedClock, SystemClock};
use homeflow_core::types::{Command, DeviceId, DriverId, Source, State};
use homeflow_devices::{Device, DeviceInfo, Driver, Registry, RegistryEvent};

use crate::context::DeviceContext;
use crate::cron::CronTicker;
use crate::device_config::{ControllerConfig, DeviceConfig, NameResolver};
use crate::error::{Error, Result};
use crate::interface_device::{InterfaceDevice, InterfaceSettings};
use crate::scheduler::Scheduler;
use crate::state_device::{StateDevice, StateSettings};

enum Built {
    State(Arc<StateDevice>),
    Interface(Arc<InterfaceDevice>),
}

impl Built {
    fn state_device(&self) -> &StateDevice {
        match self {
            Built::State(device) => device,
            Built::Interface(device) => device.state_device(),
        }
    }
}

/// The home-automation engine
pub struct Engine {
    registry: Arc<Registry>,
    scheduler: Scheduler,
    cron: CronTicker,
    clock: SharedClock,
    config: SharedConfig,
    settings: EngineConfig,
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("devices", &self.registry.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Engine {
    /// Create an engine on the host clock.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: EngineConfig) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Create an engine from a full configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::start(config.clone(), Arc::new(SystemClock))
    }

    /// Create an engine reading wall-clock time from `clock`
    pub fn with_clock(settings: EngineConfig, clock: SharedClock) -> Result<Self> {
        let config = Config {
            engine: settings,
            ..Config::default()
        };
        Self::start(config, clock)
    }

    fn start(config: Config, clock: SharedClock) -> Result<Self> {
        let settings = config.engine.clone();
        settings.validate()?;
        let scheduler = Scheduler::start();
        let cron = CronTicker::new(&scheduler, clock.clone());
        info!("HomeFlow engine started");
        Ok(Self {
            registry: Arc::new(Registry::new()),
            scheduler,
            cron,
            clock,
            config: SharedConfig::new(config),
            settings,
            drivers: RwLock::new(HashMap::new()),
        })
    }

    /// The device registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The timer scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The configuration the engine was started with
    pub fn config(&self) -> &Config {
        self.config.get()
    }

    /// The engine limits and timing
    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    /// The services handed to every device
    pub fn context(&self) -> DeviceContext {
        DeviceContext::new(
            &self.registry,
            self.scheduler.clone(),
            self.cron.clone(),
            self.clock.clone(),
            self.settings.clone(),
        )
    }

    /// Make a driver available to device configurations by name
    pub fn register_driver(&self, driver: Arc<dyn Driver>) -> Result<DriverId> {
        let mut drivers = self
            .drivers
            .write()
            .map_err(|_| Error::other("Failed to acquire driver table"))?;
        let name = driver.name().to_string();
        if drivers.contains_key(&name) {
            return Err(Error::already_exists(format!("Driver {}", name)));
        }
        let id = driver.id();
        drivers.insert(name.clone(), driver);
        info!(driver = %name, id = %id, "Registered driver");
        Ok(id)
    }

    /// Look up a driver by name
    pub fn driver(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.read().ok()?.get(name).cloned()
    }

    /// Build a device, wire it into the graph and establish its initial state
    pub fn build_device(&self, config: &DeviceConfig) -> Result<DeviceId> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(Error::configuration("Device without a name"));
        }

        let producers: Vec<DeviceId> = config
            .devices
            .iter()
            .filter_map(|producer| {
                let id = self.registry.by_name(producer).ok();
                if id.is_none() {
                    warn!(device = %name, producer = %producer, "Skipping unknown producer");
                }
                id
            })
            .collect();
        let drivers: Vec<Arc<dyn Driver>> = config
            .drivers
            .iter()
            .filter_map(|driver| {
                let found = self.driver(driver);
                if found.is_none() {
                    warn!(device = %name, driver = %driver, "Skipping unknown driver");
                }
                found
            })
            .collect();
        let interface = InterfaceSettings::from_config(config);
        if interface.is_none() && !drivers.is_empty() {
            warn!(device = %name, "Drivers configured without an address are not bound");
        }

        let (rules, issues) = config.build_rules(self);
        let settings = StateSettings::from_config(config);
        let context = self.context();

        let mut built = None;
        let id = self.registry.register(name, |id| {
            let state = StateDevice::new(id, name, settings, rules, context);
            let device: Arc<dyn Device> = match interface {
                Some(interface) => {
                    let device = Arc::new(InterfaceDevice::new(state, interface, drivers));
                    built = Some(Built::Interface(device.clone()));
                    device
                }
                None => {
                    let device = Arc::new(state);
                    built = Some(Built::State(device.clone()));
                    device
                }
            };
            Ok(device)
        })?;
        let built = built.ok_or_else(|| Error::other(format!("Device {} was not built", name)))?;

        for producer in producers {
            self.registry.get(producer)?.subscribe(id);
            built.state_device().add_producer(producer);
        }
        if let Built::Interface(device) = &built {
            device.attach_drivers();
        }

        built.state_device().initialize();
        match built.state_device().start_calendar() {
            Ok(0) => {}
            Ok(count) => debug!(device = %name, count, "Calendar rules started"),
            Err(e) => warn!(device = %name, "Cannot start calendar rules: {}", e),
        }
        if let Built::Interface(device) = &built {
            if let Err(e) = device.start_sync(self.settings.sync_min(), self.settings.sync_max()) {
                warn!(device = %name, "Cannot start sync: {}", e);
            }
        }

        info!(
            device = %name,
            id = %id,
            kind = %config.kind,
            rules = built.state_device().rules().len(),
            skipped = issues.len(),
            "Built device"
        );
        Ok(id)
    }

    /// Build every device of a controller configuration, in order.
    ///
    /// A device that cannot be built is logged and skipped.
    pub fn load(&self, config: &ControllerConfig) -> Vec<DeviceId> {
        config
            .devices
            .iter()
            .filter_map(|device| match self.build_device(device) {
                Ok(id) => Some(id),
                Err(e) => {
                    error!(device = %device.name, "Cannot build device: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Build the devices described by a TOML file
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<DeviceId>> {
        let config = ControllerConfig::load(path)?;
        Ok(self.load(&config))
    }

    /// Build the devices of the configured `general.devices_file`.
    ///
    /// Drivers the file refers to must be registered first.
    pub fn load_devices(&self) -> Result<Vec<DeviceId>> {
        let path = self.config.get().general.devices_file.clone();
        info!(path = %path, "Loading device configuration");
        self.load_file(path)
    }

    /// Issue a command to a device
    pub fn dispatch(&self, id: DeviceId, command: Command, source: Source) -> Result<()> {
        let device = self.registry.get(id)?;
        device.command(command, source, &self.context().root());
        Ok(())
    }

    /// Issue a command to a device by name
    pub fn dispatch_to(&self, name: &str, command: Command, source: Source) -> Result<()> {
        let id = self.registry.by_name(name)?;
        self.dispatch(id, command, source)
    }

    /// Look up a device by name
    pub fn device(&self, name: &str) -> Result<Arc<dyn Device>> {
        let id = self.registry.by_name(name)?;
        Ok(self.registry.get(id)?)
    }

    /// The current state of a device by name
    pub fn state(&self, name: &str) -> Result<State> {
        Ok(self.device(name)?.state())
    }

    /// Snapshot every device
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.registry.infos()?)
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Cancel every device timer and stop the scheduler
    pub fn shutdown(&self) -> Result<()> {
        self.registry.shutdown_all()?;
        self.cron.stop();
        self.scheduler.shutdown();
        info!("HomeFlow engine stopped");
        Ok(())
    }
}

impl NameResolver for Engine {
    fn device(&self, name: &str) -> Option<DeviceId> {
        self.registry.by_name(name).ok()
    }

    fn driver(&self, name: &str) -> Option<DriverId> {
        Engine::driver(self, name).map(|driver| driver.id())
    }
}
