//! Protocol library for usb-irp
//!
//! This crate defines the wire-level and shared data types used by the IRP
//! engine: endpoint addressing, the control-transfer setup packet, the
//! transfer error taxonomy reported by transports, and the payloads of pipe
//! events delivered to listeners.
//!
//! # Example
//!
//! ```
//! use protocol::{SetupPacket, constants};
//!
//! // GET_DESCRIPTOR(Device), 18 bytes
//! let setup = SetupPacket::new(
//!     constants::REQUESTTYPE_DIRECTION_IN,
//!     constants::REQUEST_GET_DESCRIPTOR,
//!     0x0100,
//!     0x0000,
//!     18,
//! );
//!
//! let bytes = setup.to_bytes();
//! assert_eq!(bytes.len(), 8);
//! assert_eq!(SetupPacket::from_bytes(&bytes).unwrap(), setup);
//! ```

pub mod constants;
pub mod error;
pub mod events;
pub mod setup;
pub mod types;

pub use error::{ProtocolError, Result};
pub use events::{DataEvent, ErrorEvent, PipeEvent};
pub use setup::{SETUP_PACKET_SIZE, SetupPacket};
pub use types::{Direction, Endpoint, EndpointAddress, EndpointType, ScopeId, UsbError};
