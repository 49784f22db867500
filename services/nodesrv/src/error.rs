//! Error handling for the node service

use loopsim_model::PacketError;
use thiserror::Error;

/// Node service error type
#[derive(Error, Debug)]
pub enum NodeError {
    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framed codec errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] PacketError),

    /// Module driver faults (bus transfers, status reads)
    #[error("Driver error: {0}")]
    Driver(String),

    /// Requested value outside a driver's physical range
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// GPIO pin naming or acquisition errors
    #[error("Pin error: {0}")]
    Pin(String),

    /// Module registry misuse (direction conflicts)
    #[error("Registry error: {0}")]
    Registry(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the node service
pub type Result<T> = std::result::Result<T, NodeError>;

// Helper methods for creating errors
impl NodeError {
    pub fn driver(msg: impl Into<String>) -> Self {
        NodeError::Driver(msg.into())
    }

    pub fn pin(msg: impl Into<String>) -> Self {
        NodeError::Pin(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        NodeError::Registry(msg.into())
    }
}

// Backend traits report plain strings (they sit below the service error
// type); lift them into driver errors at the call site.
impl From<String> for NodeError {
    fn from(msg: String) -> Self {
        NodeError::Driver(msg)
    }
}
