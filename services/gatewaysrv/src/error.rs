//! Error handling for the gateway service

use rtu_gateway::GatewayError;
use thiserror::Error;

/// Gateway Service Error Type
#[derive(Error, Debug)]
pub enum GatewaySrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Serial port errors
    #[error("Serial error: {0}")]
    SerialError(String),

    /// Listener and socket errors
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Statistics persistence errors
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Errors from the gateway core
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Result type alias for the gateway service
pub type Result<T> = std::result::Result<T, GatewaySrvError>;

impl From<std::io::Error> for GatewaySrvError {
    fn from(err: std::io::Error) -> Self {
        GatewaySrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for GatewaySrvError {
    fn from(err: figment::Error) -> Self {
        GatewaySrvError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for GatewaySrvError {
    fn from(err: serde_json::Error) -> Self {
        GatewaySrvError::StorageError(err.to_string())
    }
}

impl From<tokio_serial::Error> for GatewaySrvError {
    fn from(err: tokio_serial::Error) -> Self {
        GatewaySrvError::SerialError(err.to_string())
    }
}
