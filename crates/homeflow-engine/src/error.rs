/*!
 * Error types for the HomeFlow engine crate.
 */
use thiserror::Error;

/// Error type for HomeFlow engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Device configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A rule entry that cannot be used
    #[error("Rule error: {0}")]
    Rule(String),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] homeflow_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] homeflow_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists error
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for HomeFlow engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn configuration<S: AsRef<str>>(msg: S) -> Self {
        Error::Configuration(msg.as_ref().to_string())
    }

    /// Create a new rule error
    pub fn rule<S: AsRef<str>>(msg: S) -> Self {
        Error::Rule(msg.as_ref().to_string())
    }

    /// Create a new scheduler error
    pub fn scheduler<S: AsRef<str>>(msg: S) -> Self {
        Error::Scheduler(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::NotFound(msg.as_ref().to_string())
    }

    /// Create a new already exists error
    pub fn already_exists<S: AsRef<str>>(msg: S) -> Self {
        Error::AlreadyExists(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
