//! Error types for pedalrig-core.

use thiserror::Error;

/// Error type for engine-kernel operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Audio device busy: {0}")]
    DeviceBusy(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio stream invalid, restart required")]
    StreamInvalid,

    #[error("Command queue full")]
    Busy,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Plugin produced a non-finite output")]
    PluginFault,

    #[error("Engine disabled after repeated crashes")]
    RepeatedCrash,

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
