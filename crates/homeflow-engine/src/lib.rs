/*!
 * HomeFlow Engine
 *
 * This crate provides the stateful device engine of the HomeFlow
 * controller: rule tables, the per-device command pipeline, devices bound
 * to hardware drivers, and the timers that drive delays, triggers, idle
 * timeouts and calendar rules.
 */

#![warn(missing_docs)]

// Re-export core types
pub use homeflow_core::prelude;

pub mod context;
pub mod cron;
pub mod device_config;
pub mod engine;
pub mod error;
pub mod interface_device;
pub mod profiles;
pub mod rules;
pub mod scheduler;
pub mod state_device;

// Re-export main types for convenience
pub use context::DeviceContext;
pub use cron::{CronTicker, CronTimer};
pub use device_config::{
    CalendarSpec, ControllerConfig, DeviceConfig, NameResolver, OneOrMany, RuleEntry, RuleSlot,
};
pub use engine::Engine;
pub use error::{Error, Result};
pub use interface_device::{InterfaceDevice, InterfaceSettings};
pub use profiles::DeviceKind;
pub use rules::{RuleSet, RuleTable};
pub use scheduler::{OneShotDelay, PeriodicTick, Scheduler};
pub use state_device::{Outcome, StateDevice, StateSettings, Transition};

/// HomeFlow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("HomeFlow Engine {} initialized", VERSION);
    Ok(())
}
