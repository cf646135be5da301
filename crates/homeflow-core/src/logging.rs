/*!
 * Logging functionality for HomeFlow.
 *
 * This module provides tracing setup and the spans used to attribute log
 * lines to a device or a hardware link.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "homeflow_engine=trace")
///
/// A `RUST_LOG` environment variable takes precedence over `filter`.
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, true)
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.with_target)
}

fn install(filter: &str, with_target: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span attributing events to a device
///
/// # Arguments
///
/// * `name` - The device name
/// * `id` - The device handle, rendered for display
pub fn device_span(name: &str, id: &str) -> Span {
    tracing::debug_span!("device", name = %name, id = %id)
}

/// Create a span for a hardware link loop
///
/// # Arguments
///
/// * `name` - The link name
/// * `id` - The driver handle, if already assigned
pub fn link_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("link", name = %name, id = %id),
        None => tracing::info_span!("link", name = %name),
    }
}
