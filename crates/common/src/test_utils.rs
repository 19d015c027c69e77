//! Test utilities for usb-irp
//!
//! Provides helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_bulk_data, create_mock_setup_packet};
//!
//! # fn main() {
//! let data = create_mock_bulk_data(4);
//! assert_eq!(data, vec![0, 1, 2, 3]);
//!
//! let setup = create_mock_setup_packet(0x80, 0x06, 0x0100, 0x0000, 0x0012);
//! assert_eq!(setup[1], 0x06);
//! # }
//! ```

use protocol::{DataEvent, Endpoint, EndpointAddress, EndpointType, ErrorEvent, PipeEvent, UsbError};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a bulk endpoint for testing
///
/// # Panics
/// Panics if `address` uses reserved bits.
pub fn create_mock_bulk_endpoint(address: u8) -> Endpoint {
    Endpoint::new(
        EndpointAddress::new(address).expect("valid endpoint address"),
        EndpointType::Bulk,
        512,
    )
}

/// Create an interrupt endpoint for testing
pub fn create_mock_interrupt_endpoint(address: u8) -> Endpoint {
    Endpoint::new(
        EndpointAddress::new(address).expect("valid endpoint address"),
        EndpointType::Interrupt,
        64,
    )
}

/// Create a data event for testing
pub fn create_mock_data_event(address: u8, sequence_number: u64, data: Vec<u8>) -> PipeEvent {
    PipeEvent::Data(DataEvent {
        endpoint: EndpointAddress::new(address).expect("valid endpoint address"),
        sequence_number,
        data,
    })
}

/// Create an error event for testing
pub fn create_mock_error_event(address: u8, sequence_number: u64, error: UsbError) -> PipeEvent {
    PipeEvent::Error(ErrorEvent {
        endpoint: EndpointAddress::new(address).expect("valid endpoint address"),
        sequence_number,
        error,
    })
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Create a raw control transfer setup packet
///
/// Built byte by byte so tests can cross-check the protocol encoder.
///
/// # Arguments
/// * `request_type` - bmRequestType
/// * `request` - bRequest
/// * `value` - wValue
/// * `index` - wIndex
/// * `length` - wLength
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    [
        request_type,
        request,
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (index & 0xFF) as u8,
        ((index >> 8) & 0xFF) as u8,
        (length & 0xFF) as u8,
        ((length >> 8) & 0xFF) as u8,
    ]
}
