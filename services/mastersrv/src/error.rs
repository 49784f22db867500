//! Error handling for the master service

use loopsim_model::channel::ChannelError;
use loopsim_model::PacketError;
use thiserror::Error;

/// Master service error type
#[derive(Error, Debug)]
pub enum MasterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket connect/send/receive errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Framed codec errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] PacketError),

    /// Rejected at the enqueue boundary
    #[error("Validation error: {0}")]
    Validation(String),

    /// Channel catalog errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the master service
pub type Result<T> = std::result::Result<T, MasterError>;

impl From<figment::Error> for MasterError {
    fn from(err: figment::Error) -> Self {
        MasterError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl MasterError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MasterError::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        MasterError::Transport(msg.into())
    }
}
