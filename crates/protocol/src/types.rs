//! USB type definitions
//!
//! Endpoint addressing, transfer types and the transfer error taxonomy that
//! transports report back to the engine.

use crate::constants::*;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of the configuration/interface-setting scope a pipe belongs to
///
/// A pipe is only usable while its scope is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// Endpoint address byte (bEndpointAddress)
///
/// Bit 7 is the direction, bits 0-3 the endpoint number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    /// Parse an endpoint address, rejecting reserved bits 4-6
    pub fn new(address: u8) -> Result<Self> {
        if address & !(ENDPOINT_DIRECTION_MASK | ENDPOINT_NUMBER_MASK) != 0 {
            return Err(ProtocolError::InvalidEndpointAddress(address));
        }
        Ok(Self(address))
    }

    /// Endpoint 0 (default control pipe)
    pub const fn control() -> Self {
        Self(0)
    }

    pub fn number(&self) -> u8 {
        self.0 & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        if self.0 & ENDPOINT_DIRECTION_MASK == ENDPOINT_DIRECTION_IN {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for EndpointAddress {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<EndpointAddress> for u8 {
    fn from(address: EndpointAddress) -> u8 {
        address.0
    }
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Endpoint transfer type (bmAttributes bits 0-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    /// Decode from the bmAttributes byte of an endpoint descriptor
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDPOINT_TYPE_MASK {
            ENDPOINT_TYPE_CONTROL => EndpointType::Control,
            ENDPOINT_TYPE_ISOCHRONOUS => EndpointType::Isochronous,
            ENDPOINT_TYPE_BULK => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Identity of the endpoint a pipe is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint address (includes direction bit)
    pub address: EndpointAddress,
    /// Transfer type
    pub transfer_type: EndpointType,
    /// Maximum packet size (wMaxPacketSize)
    pub max_packet_size: u16,
}

impl Endpoint {
    pub fn new(address: EndpointAddress, transfer_type: EndpointType, max_packet_size: u16) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
        }
    }

    /// The default control endpoint
    pub fn default_control() -> Self {
        Self::new(
            EndpointAddress::control(),
            EndpointType::Control,
            DEFAULT_CONTROL_MAX_PACKET_SIZE,
        )
    }

    /// Data direction of the endpoint
    ///
    /// Control endpoints are bidirectional; their per-transfer direction comes
    /// from the setup packet instead.
    pub fn direction(&self) -> Direction {
        self.address.direction()
    }

    pub fn is_control(&self) -> bool {
        self.transfer_type == EndpointType::Control
    }
}

/// Transfer error reported by a transport
///
/// Each variant maps directly to a condition the transport observed; the
/// engine only adds [`UsbError::IncompleteTransfer`] when a short packet is
/// not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum UsbError {
    /// Endpoint busy or another transfer is in progress
    #[error("endpoint busy, transfer already in progress")]
    Busy,
    /// Not enough bus bandwidth to schedule the transfer
    #[error("insufficient bandwidth")]
    NoBandwidth,
    /// Fewer bytes than requested and short packets are not accepted
    #[error("incomplete transfer (short packet rejected)")]
    IncompleteTransfer,
    /// Endpoint halted (stall)
    #[error("endpoint halted")]
    Halted,
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Transfer was cancelled (aborted)
    #[error("transfer cancelled")]
    Cancelled,
    /// Unclassified I/O failure
    #[error("I/O error")]
    Io,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address_fields() {
        let ep_in = EndpointAddress::new(0x81).unwrap();
        assert_eq!(ep_in.number(), 1);
        assert_eq!(ep_in.direction(), Direction::In);

        let ep_out = EndpointAddress::new(0x02).unwrap();
        assert_eq!(ep_out.number(), 2);
        assert_eq!(ep_out.direction(), Direction::Out);
    }

    #[test]
    fn test_endpoint_address_reserved_bits() {
        assert_eq!(
            EndpointAddress::new(0x90),
            Err(ProtocolError::InvalidEndpointAddress(0x90))
        );
        assert!(EndpointAddress::try_from(0x8F).is_ok());
    }

    #[test]
    fn test_endpoint_type_from_attributes() {
        assert_eq!(EndpointType::from_attributes(0x00), EndpointType::Control);
        assert_eq!(EndpointType::from_attributes(0x01), EndpointType::Isochronous);
        assert_eq!(EndpointType::from_attributes(0x02), EndpointType::Bulk);
        assert_eq!(EndpointType::from_attributes(0x03), EndpointType::Interrupt);
        // Synchronization/usage bits are ignored
        assert_eq!(EndpointType::from_attributes(0x0D), EndpointType::Isochronous);
    }

    #[test]
    fn test_default_control_endpoint() {
        let ep = Endpoint::default_control();
        assert!(ep.is_control());
        assert_eq!(ep.address.as_u8(), 0);
        assert_eq!(ep.max_packet_size, 64);
    }

    #[test]
    fn test_usb_error_equality() {
        assert_eq!(UsbError::Timeout, UsbError::Timeout);
        assert_ne!(UsbError::Timeout, UsbError::Cancelled);
        assert!(UsbError::Halted.to_string().contains("halted"));
    }
}
