//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Endpoint attributes carry an unknown transfer type
    #[error("Invalid endpoint attributes: {0:#04x}")]
    InvalidEndpointType(u8),

    /// Endpoint address uses reserved bits
    #[error("Invalid endpoint address: {0:#04x}")]
    InvalidEndpointAddress(u8),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
