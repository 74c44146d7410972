use std::io;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to preferences file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on preferences file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to read/write preferences file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build preferences file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (preferences): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start (runtime): {source}")]
    Runtime { source: io::Error },

    #[error("Failed to read from the terminal: {source}")]
    Terminal { source: io::Error },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{0} is not supported on this system")]
    Unsupported(&'static str),

    #[error("No device selected")]
    NoDeviceSelected,

    #[error("No serial port selected")]
    NoPortSelected,

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    Dropped(String),

    #[error("{0} took too long")]
    Timeout(&'static str),

    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("Error communicating with serial port: {source}")]
    Serial { #[from] source: serialport::Error },

    #[error("Serial I/O error: {source}")]
    Io { #[from] source: io::Error },
}

impl TransportError {
    /// The user dismissed the device or port choice; nothing to report.
    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, TransportError::NoDeviceSelected | TransportError::NoPortSelected)
    }

    /// Errors that mean the link itself is gone, as opposed to a refused operation.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Dropped(_)
                | TransportError::Btle { .. }
                | TransportError::Serial { .. }
                | TransportError::Io { .. }
        )
    }
}
