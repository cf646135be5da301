/*!
 * HomeFlow Devices
 *
 * This crate provides the device contract, the device registry and the
 * generic driver machinery (link loop, transports and codecs) of the
 * HomeFlow controller.
 */

#![warn(missing_docs)]

// Re-export core types
pub use homeflow_core::prelude;

pub mod codec;
pub mod device;
pub mod driver;
pub mod link;
pub mod registry;
pub mod transport;

// Re-export the contracts and their basic implementations
pub use codec::{Codec, Inbound, LineCodec};
pub use device::{CommandContext, Device, DeviceError, DeviceInfo};
pub use driver::{Driver, DriverOptions, EventSink, MemoryDriver};
pub use link::LinkDriver;
pub use registry::{Registry, RegistryEvent};
pub use transport::{StreamTransport, Transport};

/// HomeFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), homeflow_core::error::Error> {
    tracing::info!("HomeFlow Devices {} initialized", VERSION);
    Ok(())
}
