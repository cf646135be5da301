/*!
 * Services shared by every device of an engine.
 */
use std::sync::{Arc, Weak};

use tracing::debug;

use homeflow_core::config::EngineConfig;
use homeflow_core::time::SharedClock;
use homeflow_core::types::{Command, DeviceId, Source, State};
use homeflow_devices::{CommandContext, Device, Registry};

use crate::cron::CronTicker;
use crate::scheduler::Scheduler;

/// What a device needs from its engine: the registry to reach other
/// devices by handle, the timer services and the wall clock.
///
/// The registry is held weakly so devices never keep it alive.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    registry: Weak<Registry>,
    scheduler: Scheduler,
    cron: CronTicker,
    clock: SharedClock,
    settings: EngineConfig,
}

impl DeviceContext {
    /// Create a context
    pub fn new(
        registry: &Arc<Registry>,
        scheduler: Scheduler,
        cron: CronTicker,
        clock: SharedClock,
        settings: EngineConfig,
    ) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            scheduler,
            cron,
            clock,
            settings,
        }
    }

    /// The registry, unless the engine is gone
    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.registry.upgrade()
    }

    /// The timer scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The calendar ticker
    pub fn cron(&self) -> &CronTicker {
        &self.cron
    }

    /// The wall clock
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Engine limits and timing
    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    /// A fresh propagation context bounded by the configured depth
    pub fn root(&self) -> CommandContext {
        CommandContext::new(self.settings.max_delegation_depth)
    }

    /// Look up a device
    pub fn device(&self, id: DeviceId) -> Option<Arc<dyn Device>> {
        self.registry()?.get(id).ok()
    }

    /// The current state of a device
    pub fn state_of(&self, id: DeviceId) -> Option<State> {
        self.device(id).map(|device| device.state())
    }

    /// Issue a command to a device on a fresh propagation path
    pub fn dispatch(&self, id: DeviceId, command: Command, source: Source) {
        match self.device(id) {
            Some(device) => device.command(command, source, &self.root()),
            None => debug!(id = %id, command = %command, "Dropping command for missing device"),
        }
    }

    /// A timer callback that has a device issue a command to itself
    pub fn reissue(&self, id: DeviceId, command: Command) -> impl Fn() + Send + Sync + 'static {
        let registry = self.registry.clone();
        let depth = self.settings.max_delegation_depth;
        move || {
            let Some(device) = registry.upgrade().and_then(|registry| registry.get(id).ok()) else {
                return;
            };
            device.command(command, Source::Device(id), &CommandContext::new(depth));
        }
    }
}
