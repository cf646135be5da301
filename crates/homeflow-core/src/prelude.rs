/*!
 * Prelude module for HomeFlow Core.
 *
 * This module re-exports commonly used types and functions from the HomeFlow Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{
    Address, Command, CommandKind, DeviceId, DriverId, Source, State, StateKind,
};

// Re-export time types
pub use crate::time::{
    parse_clock_time, Clock, CronSpec, FieldSet, ManualClock, SharedClock, SystemClock, TimeRange,
};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, EngineConfig, SharedConfig};

// Re-export utility functions
pub use crate::utils::seconds_to_duration;

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
