//! Common error types for the VRR workspace.

use std::fmt;

/// A specialized Result type for VRR operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for VRR operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fabric error: {0}")]
    Fabric(String),

    #[error("Routing error: {0}")]
    Route(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new fabric error.
    pub fn fabric(msg: impl fmt::Display) -> Self {
        Error::Fabric(msg.to_string())
    }

    /// Create a new routing error.
    pub fn route(msg: impl fmt::Display) -> Self {
        Error::Route(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
