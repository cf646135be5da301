/*!
 * HomeFlow Core
 *
 * This crate provides the shared vocabulary of the HomeFlow controller:
 * commands and states, device and driver handles, wall-clock handling,
 * configuration, and logging.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod time;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
}

/// HomeFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("HomeFlow Core {} initialized", VERSION);
    Ok(())
}
