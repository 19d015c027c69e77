//! Transport and scope seams
//!
//! The engine never touches hardware. A [`Transport`] performs the physical
//! transfer on its own threads and reports exactly one completion per begun
//! transfer through the [`CompletionSink`] it was handed.
//!
//! # Contract
//!
//! - `begin_transfer` must not report the completion from inside the call.
//! - Every successfully begun transfer completes exactly once, including
//!   after `cancel` (with [`UsbError::Cancelled`] unless it already finished).
//! - The buffer travels with the request and comes back in the completion.

use protocol::{Direction, EndpointAddress, EndpointType, ScopeId, SetupPacket, UsbError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

use crate::sync::lock;

/// Transport-assigned identifier of a physical transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferHandle(pub u64);

/// One physical transfer handed to a transport
#[derive(Debug)]
pub struct TransferRequest {
    pub endpoint: EndpointAddress,
    pub transfer_type: EndpointType,
    /// Data stage direction (from the setup packet on control pipes)
    pub direction: Direction,
    /// Present for control transfers
    pub setup: Option<SetupPacket>,
    /// Whole IRP buffer; the transfer covers `offset..offset + length`
    pub buffer: Vec<u8>,
    pub offset: usize,
    pub length: usize,
    pub accept_short_packet: bool,
}

impl TransferRequest {
    /// The region of the buffer covered by this transfer
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..self.offset + self.length]
    }
}

/// Result of a physical transfer
#[derive(Debug)]
pub struct TransferCompletion {
    pub handle: TransferHandle,
    /// The request's buffer, handed back
    pub buffer: Vec<u8>,
    /// Bytes transferred starting at the request offset
    pub actual_length: usize,
    pub error: Option<UsbError>,
}

/// A transfer the transport refused to start
#[derive(Debug, Error)]
#[error("transfer could not be started: {error}")]
pub struct BeginError {
    pub error: UsbError,
    /// The request's buffer, handed back
    pub buffer: Vec<u8>,
}

/// Receiver of transfer completions
///
/// Called from transport threads. Implementations must only enqueue.
pub trait CompletionSink: Send + Sync {
    fn on_transfer_complete(&self, completion: TransferCompletion);
}

/// Performs physical transfers
pub trait Transport: Send + Sync {
    fn begin_transfer(
        &self,
        request: TransferRequest,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<TransferHandle, BeginError>;

    /// Request cancellation; the completion still arrives through the sink
    fn cancel(&self, handle: TransferHandle);
}

/// Answers whether a configuration/interface-setting scope is active
pub trait Scope: Send + Sync {
    fn is_active(&self, scope: ScopeId) -> bool;
}

/// In-memory [`Scope`] implementation
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    active: Mutex<HashSet<ScopeId>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, scope: ScopeId) {
        debug!("Activating scope {}", scope.0);
        lock(&self.active).insert(scope);
    }

    pub fn deactivate(&self, scope: ScopeId) {
        debug!("Deactivating scope {}", scope.0);
        lock(&self.active).remove(&scope);
    }
}

impl Scope for ScopeRegistry {
    fn is_active(&self, scope: ScopeId) -> bool {
        lock(&self.active).contains(&scope)
    }
}
