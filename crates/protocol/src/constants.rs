//! Standard USB constants used by the engine
//!
//! Values follow chapter 9 of the USB 2.0 specification.

// Endpoint address and attribute fields
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;
pub const ENDPOINT_DIRECTION_MASK: u8 = 0x80;
pub const ENDPOINT_DIRECTION_OUT: u8 = 0x00;
pub const ENDPOINT_DIRECTION_IN: u8 = 0x80;
pub const ENDPOINT_TYPE_MASK: u8 = 0x03;
pub const ENDPOINT_TYPE_CONTROL: u8 = 0x00;
pub const ENDPOINT_TYPE_ISOCHRONOUS: u8 = 0x01;
pub const ENDPOINT_TYPE_BULK: u8 = 0x02;
pub const ENDPOINT_TYPE_INTERRUPT: u8 = 0x03;

// bmRequestType fields
pub const REQUESTTYPE_DIRECTION_MASK: u8 = 0x80;
pub const REQUESTTYPE_DIRECTION_OUT: u8 = 0x00;
pub const REQUESTTYPE_DIRECTION_IN: u8 = 0x80;
pub const REQUESTTYPE_TYPE_MASK: u8 = 0x60;
pub const REQUESTTYPE_TYPE_STANDARD: u8 = 0x00;
pub const REQUESTTYPE_TYPE_CLASS: u8 = 0x20;
pub const REQUESTTYPE_TYPE_VENDOR: u8 = 0x40;
pub const REQUESTTYPE_RECIPIENT_MASK: u8 = 0x1f;
pub const REQUESTTYPE_RECIPIENT_DEVICE: u8 = 0x00;
pub const REQUESTTYPE_RECIPIENT_INTERFACE: u8 = 0x01;
pub const REQUESTTYPE_RECIPIENT_ENDPOINT: u8 = 0x02;
pub const REQUESTTYPE_RECIPIENT_OTHER: u8 = 0x03;

// Standard request codes (bRequest)
pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_FEATURE: u8 = 0x03;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_DESCRIPTOR: u8 = 0x07;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;
pub const REQUEST_SYNCH_FRAME: u8 = 0x0c;

/// Feature selector for CLEAR_FEATURE(ENDPOINT_HALT)
pub const FEATURE_ENDPOINT_HALT: u16 = 0x0000;

/// Default max packet size for endpoint 0 on full/high speed devices
pub const DEFAULT_CONTROL_MAX_PACKET_SIZE: u16 = 64;
