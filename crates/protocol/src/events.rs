//! Pipe event payloads
//!
//! Events are produced by the engine after a submission completes and are
//! delivered to pipe listeners. They own their data so they can be forwarded
//! across threads or channels.

use crate::types::{EndpointAddress, UsbError};
use serde::{Deserialize, Serialize};

/// Successful data transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Endpoint of the pipe that fired the event
    pub endpoint: EndpointAddress,
    /// Sequence number of the completed activation
    pub sequence_number: u64,
    /// Bytes actually transferred
    pub data: Vec<u8>,
}

impl DataEvent {
    /// Number of valid bytes transferred
    pub fn data_length(&self) -> usize {
        self.data.len()
    }
}

/// Failed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Endpoint of the pipe that fired the event
    pub endpoint: EndpointAddress,
    /// Sequence number of the completed activation
    pub sequence_number: u64,
    /// Failure classification
    pub error: UsbError,
}

/// Event fired by a pipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipeEvent {
    Data(DataEvent),
    Error(ErrorEvent),
}

impl PipeEvent {
    pub fn sequence_number(&self) -> u64 {
        match self {
            PipeEvent::Data(event) => event.sequence_number,
            PipeEvent::Error(event) => event.sequence_number,
        }
    }

    pub fn endpoint(&self) -> EndpointAddress {
        match self {
            PipeEvent::Data(event) => event.endpoint,
            PipeEvent::Error(event) => event.endpoint,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PipeEvent::Error(_))
    }
}
