//! Engine error types

use protocol::UsbError;
use thiserror::Error;

/// Coarse classification of a [`PipeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Pipe state does not allow the operation; never retried
    Configuration,
    /// The transfer itself failed
    Transfer,
    /// The caller violated an API contract
    Programming,
}

/// Errors surfaced by pipe and IRP operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipeError {
    /// Pipe has not been opened
    #[error("pipe is not open")]
    NotOpen,

    /// Owning configuration or interface setting is not active
    #[error("pipe is not active")]
    NotActive,

    /// Close attempted while submissions are still active
    #[error("{active} submission(s) still active, abort them before closing")]
    SubmissionsPending { active: usize },

    /// Abort in progress, new submissions are rejected
    #[error("pipe is aborting all submissions")]
    PipeClosed,

    /// Transfer completed with an error
    #[error("transfer failed: {0}")]
    Transfer(#[from] UsbError),

    /// Invalid offset, length or submission shape
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// IRP is active and cannot be submitted or modified
    #[error("irp is active")]
    IrpActive,

    /// Blocking call made from the pipe's own completion worker
    #[error("blocking pipe operation called from the completion worker")]
    CompletionContext,

    /// Background thread could not be started
    #[error("failed to spawn {0}")]
    WorkerSpawn(String),
}

impl PipeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipeError::NotOpen
            | PipeError::NotActive
            | PipeError::SubmissionsPending { .. }
            | PipeError::PipeClosed
            | PipeError::WorkerSpawn(_) => ErrorKind::Configuration,
            PipeError::Transfer(_) => ErrorKind::Transfer,
            PipeError::InvalidArgument(_) | PipeError::IrpActive | PipeError::CompletionContext => {
                ErrorKind::Programming
            }
        }
    }

    /// The transfer error, if this is one
    pub fn usb_error(&self) -> Option<UsbError> {
        match self {
            PipeError::Transfer(error) => Some(*error),
            _ => None,
        }
    }
}

/// Type alias for engine results
pub type Result<T> = std::result::Result<T, PipeError>;
