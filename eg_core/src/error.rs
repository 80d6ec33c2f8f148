/// Core error type for egress
///
/// Only configuration-class failures live here. Errors returned by a wrapped
/// transport or driver are handed back to the caller in their own type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid connection descriptor: {0}")]
    Descriptor(String),

    #[error("Metric registration error: {0}")]
    Registration(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
