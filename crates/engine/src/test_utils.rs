//! Test utilities for the engine
//!
//! [`ManualTransport`] records every request and lets the test decide when
//! and how each transfer completes. [`RecordingListener`] collects events.
//!
//! # Example
//!
//! ```
//! use engine::test_utils::{ManualTransport, RecordingListener, open_test_pipe};
//! use common::test_utils::create_mock_bulk_endpoint;
//!
//! let transport = ManualTransport::new();
//! let (pipe, _scopes) = open_test_pipe(create_mock_bulk_endpoint(0x01), transport.clone());
//! let listener = RecordingListener::new();
//! pipe.add_shared_listener(listener.clone());
//!
//! let irp = pipe.async_submit_buffer(vec![1, 2, 3]).unwrap();
//! let handle = transport.wait_for_pending(1).unwrap()[0];
//! transport.complete_ok(handle, &[]);
//!
//! assert!(irp.wait_until_complete(None));
//! assert!(listener.wait_for_events(1));
//! ```

use crate::events::PipeListener;
use crate::pipe::Pipe;
use crate::sync::{lock, wait_timeout_while};
use crate::transport::{
    BeginError, CompletionSink, ScopeRegistry, TransferCompletion, TransferHandle,
    TransferRequest, Transport,
};
use common::test_utils::DEFAULT_TEST_TIMEOUT;
use protocol::{EndpointAddress, PipeEvent, ScopeId, SetupPacket, UsbError};
use std::sync::{Arc, Condvar, Mutex};

/// Scope used by [`open_test_pipe`]
pub const TEST_SCOPE: ScopeId = ScopeId(1);

/// Create an open pipe over `transport` with an active scope
///
/// # Panics
/// Panics if the pipe cannot be created or opened.
pub fn open_test_pipe(
    endpoint: protocol::Endpoint,
    transport: Arc<dyn Transport>,
) -> (Pipe, Arc<ScopeRegistry>) {
    let scopes = Arc::new(ScopeRegistry::new());
    scopes.activate(TEST_SCOPE);
    let pipe = Pipe::new(endpoint, TEST_SCOPE, scopes.clone(), transport).expect("create pipe");
    pipe.open().expect("open pipe");
    (pipe, scopes)
}

/// Snapshot of a request handed to [`ManualTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTransfer {
    pub handle: TransferHandle,
    pub endpoint: EndpointAddress,
    pub setup: Option<SetupPacket>,
    pub offset: usize,
    pub length: usize,
    /// Bytes in the transfer window at submission
    pub data: Vec<u8>,
}

struct Outstanding {
    handle: TransferHandle,
    request: TransferRequest,
    sink: Arc<dyn CompletionSink>,
}

#[derive(Default)]
struct ManualState {
    next_handle: u64,
    outstanding: Vec<Outstanding>,
    submitted: Vec<SubmittedTransfer>,
    cancelled: Vec<TransferHandle>,
    reject_next: Option<UsbError>,
    hold_cancellations: bool,
}

/// Transport whose transfers complete only when the test says so
///
/// `cancel` completes an outstanding transfer with `Cancelled` right away,
/// from the cancelling thread, unless [`ManualTransport::hold_cancellations`]
/// was called.
#[derive(Default)]
pub struct ManualTransport {
    state: Mutex<ManualState>,
    changed: Condvar,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every request seen so far, in submission order
    pub fn submissions(&self) -> Vec<SubmittedTransfer> {
        lock(&self.state).submitted.clone()
    }

    pub fn submission_count(&self) -> usize {
        lock(&self.state).submitted.len()
    }

    /// Handles of transfers not yet completed, oldest first
    pub fn pending(&self) -> Vec<TransferHandle> {
        lock(&self.state)
            .outstanding
            .iter()
            .map(|o| o.handle)
            .collect()
    }

    pub fn cancelled(&self) -> Vec<TransferHandle> {
        lock(&self.state).cancelled.clone()
    }

    /// Wait until at least `count` transfers are outstanding
    ///
    /// Returns their handles, or `None` after [`DEFAULT_TEST_TIMEOUT`].
    pub fn wait_for_pending(&self, count: usize) -> Option<Vec<TransferHandle>> {
        let state = lock(&self.state);
        let (state, _) = wait_timeout_while(&self.changed, state, DEFAULT_TEST_TIMEOUT, |s| {
            s.outstanding.len() < count
        });
        (state.outstanding.len() >= count)
            .then(|| state.outstanding.iter().map(|o| o.handle).collect())
    }

    /// Wait until at least `count` requests have been submitted in total
    pub fn wait_for_submissions(&self, count: usize) -> bool {
        let state = lock(&self.state);
        let (state, _) = wait_timeout_while(&self.changed, state, DEFAULT_TEST_TIMEOUT, |s| {
            s.submitted.len() < count
        });
        state.submitted.len() >= count
    }

    /// Wait until at least `count` cancellations were requested
    pub fn wait_for_cancellations(&self, count: usize) -> bool {
        let state = lock(&self.state);
        let (state, _) = wait_timeout_while(&self.changed, state, DEFAULT_TEST_TIMEOUT, |s| {
            s.cancelled.len() < count
        });
        state.cancelled.len() >= count
    }

    /// Only record cancellations; the test completes the transfers itself
    pub fn hold_cancellations(&self) {
        lock(&self.state).hold_cancellations = true;
    }

    /// Make the next `begin_transfer` fail with `error`
    pub fn reject_next(&self, error: UsbError) {
        lock(&self.state).reject_next = Some(error);
    }

    /// Complete successfully, copying `payload` into the transfer window
    ///
    /// For OUT transfers pass an empty payload to report the full length.
    pub fn complete_ok(&self, handle: TransferHandle, payload: &[u8]) -> bool {
        self.complete_with(handle, |request| {
            if payload.is_empty() {
                request.length
            } else {
                let count = payload.len().min(request.length);
                request.data_mut()[..count].copy_from_slice(&payload[..count]);
                count
            }
        }, None)
    }

    /// Complete with an error and no data
    pub fn complete_err(&self, handle: TransferHandle, error: UsbError) -> bool {
        self.complete_with(handle, |_| 0, Some(error))
    }

    /// Complete reporting an arbitrary length, even one past the request
    pub fn complete_raw(
        &self,
        handle: TransferHandle,
        actual_length: usize,
        error: Option<UsbError>,
    ) -> bool {
        self.complete_with(handle, |_| actual_length, error)
    }

    fn complete_with(
        &self,
        handle: TransferHandle,
        fill: impl FnOnce(&mut TransferRequest) -> usize,
        error: Option<UsbError>,
    ) -> bool {
        let Some(mut outstanding) = self.take(handle) else {
            return false;
        };
        let actual_length = fill(&mut outstanding.request);
        outstanding.sink.on_transfer_complete(TransferCompletion {
            handle,
            buffer: outstanding.request.buffer,
            actual_length,
            error,
        });
        true
    }

    fn take(&self, handle: TransferHandle) -> Option<Outstanding> {
        let mut state = lock(&self.state);
        let position = state.outstanding.iter().position(|o| o.handle == handle)?;
        let outstanding = state.outstanding.remove(position);
        self.changed.notify_all();
        Some(outstanding)
    }
}

impl Transport for ManualTransport {
    fn begin_transfer(
        &self,
        request: TransferRequest,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<TransferHandle, BeginError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.reject_next.take() {
            return Err(BeginError {
                error,
                buffer: request.buffer,
            });
        }

        state.next_handle += 1;
        let handle = TransferHandle(state.next_handle);
        state.submitted.push(SubmittedTransfer {
            handle,
            endpoint: request.endpoint,
            setup: request.setup,
            offset: request.offset,
            length: request.length,
            data: request.data().to_vec(),
        });
        state.outstanding.push(Outstanding {
            handle,
            request,
            sink,
        });
        self.changed.notify_all();
        Ok(handle)
    }

    fn cancel(&self, handle: TransferHandle) {
        let hold = {
            let mut state = lock(&self.state);
            state.cancelled.push(handle);
            self.changed.notify_all();
            state.hold_cancellations
        };
        if !hold {
            self.complete_err(handle, UsbError::Cancelled);
        }
    }
}

/// Listener that records every event it receives
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<PipeEvent>>,
    changed: Condvar,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PipeEvent> {
        lock(&self.events).clone()
    }

    pub fn sequence_numbers(&self) -> Vec<u64> {
        lock(&self.events)
            .iter()
            .map(PipeEvent::sequence_number)
            .collect()
    }

    /// Wait until at least `count` events arrived, up to [`DEFAULT_TEST_TIMEOUT`]
    pub fn wait_for_events(&self, count: usize) -> bool {
        let events = lock(&self.events);
        let (events, _) = wait_timeout_while(&self.changed, events, DEFAULT_TEST_TIMEOUT, |e| {
            e.len() < count
        });
        events.len() >= count
    }
}

impl PipeListener for RecordingListener {
    fn on_event(&self, event: &PipeEvent) {
        lock(&self.events).push(event.clone());
        self.changed.notify_all();
    }
}
