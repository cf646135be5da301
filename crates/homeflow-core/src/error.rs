/*!
 * Error types for the HomeFlow core crate.
 */
use thiserror::Error;

/// Error type for HomeFlow core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for HomeFlow core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new parse error
    pub fn parse<S: AsRef<str>>(msg: S) -> Self {
        Error::Parse(msg.as_ref().to_string())
    }

    /// Create a new runtime error
    pub fn runtime<S: AsRef<str>>(msg: S) -> Self {
        Error::Runtime(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
