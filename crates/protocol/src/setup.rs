//! Control transfer setup packet
//!
//! The only wire layout owned by the engine. Layout (8 bytes):
//!
//! ```text
//! [bmRequestType: u8][bRequest: u8][wValue: u16 LE][wIndex: u16 LE][wLength: u16 LE]
//! ```

use crate::constants::REQUESTTYPE_DIRECTION_MASK;
use crate::error::{ProtocolError, Result};
use crate::types::Direction;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of an encoded setup packet
pub const SETUP_PACKET_SIZE: usize = 8;

/// Control transfer setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetupPacket {
    /// Request type byte (bmRequestType)
    pub request_type: u8,
    /// Request byte (bRequest)
    pub request: u8,
    /// Value parameter (wValue)
    pub value: u16,
    /// Index parameter (wIndex)
    pub index: u16,
    /// Data stage length (wLength)
    pub length: u16,
}

impl SetupPacket {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Direction of the data stage, taken from bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        if self.request_type & REQUESTTYPE_DIRECTION_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Encode into the 8-byte little-endian wire format
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut bytes = [0u8; SETUP_PACKET_SIZE];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        LittleEndian::write_u16(&mut bytes[2..4], self.value);
        LittleEndian::write_u16(&mut bytes[4..6], self.index);
        LittleEndian::write_u16(&mut bytes[6..8], self.length);
        bytes
    }

    /// Decode from the wire format; trailing bytes are ignored
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETUP_PACKET_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: SETUP_PACKET_SIZE,
                available: bytes.len(),
            });
        }

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }
}
