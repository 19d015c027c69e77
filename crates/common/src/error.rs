//! Errors raised by the shared event bridge and logging setup

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The other half of the event bridge is gone
    #[error("Event channel closed: {0}")]
    EventChannelClosed(String),

    #[error("Invalid log filter '{filter}': {reason}")]
    LogFilter { filter: String, reason: String },

    /// A global subscriber was installed earlier in this process
    #[error("Logging already initialized: {0}")]
    LoggingInstalled(String),
}

pub type Result<T> = std::result::Result<T, Error>;
