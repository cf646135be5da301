/*!
 * Device trait and core device abstractions.
 *
 * This module defines the contract every HomeFlow device fulfils, the
 * propagation context carried by each command, and the error type shared
 * by devices and drivers.
 */
use std::fmt::Debug;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use homeflow_core::{
    error::Error as CoreError,
    types::{Address, Command, DeviceId, Source, State},
};

/// Error type for device and driver operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A state outside the device's declared set
    #[error("Invalid state {state} for device {device}")]
    InvalidState {
        /// The device name
        device: String,
        /// The rejected state
        state: State,
    },

    /// No reply arrived within the retry bound
    #[error("I/O timeout after {attempts} attempts")]
    IoTimeout {
        /// How many times the request was written
        attempts: u32,
    },

    /// Bytes that could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// No device or driver with that handle or name
    #[error("Not found: {0}")]
    NotFound(String),

    /// A device or driver with that name already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The link loop has stopped
    #[error("Link closed: {0}")]
    LinkClosed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    CoreError(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new malformed-frame error
    pub fn malformed<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::MalformedFrame(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn configuration<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::ConfigurationError(msg.as_ref().to_string())
    }

    /// Create a new not-found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::NotFound(msg.as_ref().to_string())
    }

    /// Create a new link-closed error
    pub fn link_closed<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::LinkClosed(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }
}

/// Default bound on the length of a delegation chain
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// The propagation path of a command.
///
/// Each delegation hop appends the notifying device. A device that finds
/// itself on the trail drops the command, so cyclic device graphs
/// terminate, and the trail length is capped at `max_depth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    trail: Vec<DeviceId>,
    max_depth: usize,
}

impl Default for CommandContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl CommandContext {
    /// Start a fresh propagation path
    pub fn new(max_depth: usize) -> Self {
        Self {
            trail: Vec::new(),
            max_depth,
        }
    }

    /// Whether a device has already handled this command
    pub fn contains(&self, id: DeviceId) -> bool {
        self.trail.contains(&id)
    }

    /// Number of hops so far
    pub fn depth(&self) -> usize {
        self.trail.len()
    }

    /// The devices on the path, oldest first
    pub fn trail(&self) -> &[DeviceId] {
        &self.trail
    }

    /// The context for the next hop, or `None` once the depth bound is hit
    pub fn descend(&self, id: DeviceId) -> Option<Self> {
        if self.trail.len() >= self.max_depth {
            return None;
        }
        let mut next = self.clone();
        next.trail.push(id);
        Some(next)
    }

    /// A fresh context with the same depth bound
    pub fn fresh(&self) -> Self {
        Self::new(self.max_depth)
    }
}

/// A serializable snapshot of a device, for introspection front ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The device handle
    pub id: DeviceId,
    /// The device name
    pub name: String,
    /// The device profile
    pub kind: String,
    /// The hardware address, for interface devices
    pub address: Option<Address>,
    /// Current state
    pub state: State,
    /// Last distinct state
    pub previous_state: State,
    /// Last committed command
    pub previous_command: Option<Command>,
    /// When the state was last committed
    pub last_set_at: Option<NaiveDateTime>,
    /// Whether automatic scheduling is active
    pub automatic: bool,
    /// Devices this device listens to
    pub producers: Vec<DeviceId>,
    /// Devices this device notifies
    pub delegates: Vec<DeviceId>,
}

/// The core device trait
///
/// Devices are synchronous objects; they are driven from whichever task
/// delivers the event, and serialize their own state changes.
pub trait Device: Send + Sync + Debug {
    /// Get the device handle
    fn id(&self) -> DeviceId;

    /// Get the device name
    fn name(&self) -> &str;

    /// Get the current state
    fn state(&self) -> State;

    /// Issue a command to the device.
    ///
    /// Never fails to the caller: rejected or filtered commands are logged
    /// and leave the device untouched.
    fn command(&self, command: Command, source: Source, ctx: &CommandContext);

    /// Whether the device owns a hardware address
    fn address_matches(&self, _address: &Address) -> bool {
        false
    }

    /// Add a device to be notified of committed transitions
    fn subscribe(&self, delegate: DeviceId);

    /// Stop notifying a device
    fn unsubscribe(&self, delegate: DeviceId);

    /// Record that this device listens to another one
    fn add_producer(&self, producer: DeviceId);

    /// The devices notified on commit, in order
    fn delegates(&self) -> Vec<DeviceId>;

    /// The devices this one listens to, in order
    fn producers(&self) -> Vec<DeviceId>;

    /// Snapshot the device for introspection
    fn info(&self) -> DeviceInfo;

    /// Cancel every timer the device owns
    fn shutdown(&self) {}
}
