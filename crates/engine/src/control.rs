//! Control transfer IRPs

use crate::irp::Irp;
use protocol::constants::REQUESTTYPE_DIRECTION_MASK;
use protocol::{Direction, SetupPacket};
use std::ops::Deref;

/// Setup fields of a control request, without the length
///
/// The length is taken from the IRP's requested length at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
        }
    }

    /// Data stage direction from bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        if self.request_type & REQUESTTYPE_DIRECTION_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Build the setup packet for a data stage of `length` bytes
    pub fn setup_packet(&self, length: u16) -> SetupPacket {
        SetupPacket::new(self.request_type, self.request, self.value, self.index, length)
    }
}

/// An IRP carrying control setup fields
///
/// Dereferences to [`Irp`]; the setup fields are fixed at construction.
#[derive(Debug, Clone)]
pub struct ControlIrp {
    irp: Irp,
    request: ControlRequest,
}

impl ControlIrp {
    pub fn new(request: ControlRequest, data: Vec<u8>) -> Self {
        Self {
            irp: Irp::build(data, Some(request)),
            request,
        }
    }

    /// Shorthand for [`ControlIrp::new`] with the fields spelled out
    pub fn with_fields(request_type: u8, request: u8, value: u16, index: u16, data: Vec<u8>) -> Self {
        Self::new(ControlRequest::new(request_type, request, value, index), data)
    }

    pub fn request(&self) -> ControlRequest {
        self.request
    }

    pub fn request_type(&self) -> u8 {
        self.request.request_type
    }

    pub fn request_code(&self) -> u8 {
        self.request.request
    }

    pub fn value(&self) -> u16 {
        self.request.value
    }

    pub fn index(&self) -> u16 {
        self.request.index
    }

    pub fn irp(&self) -> &Irp {
        &self.irp
    }

    pub fn into_irp(self) -> Irp {
        self.irp
    }
}

impl Deref for ControlIrp {
    type Target = Irp;

    fn deref(&self) -> &Irp {
        &self.irp
    }
}

impl From<ControlIrp> for Irp {
    fn from(control: ControlIrp) -> Irp {
        control.irp
    }
}
