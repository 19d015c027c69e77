//! Common utilities for usb-irp
//!
//! This crate provides functionality shared between the engine and the
//! loopback binary: error handling, logging setup, and the async channel
//! bridge that carries pipe events from the completion worker to async
//! consumers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{EventForwarder, EventStream, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
