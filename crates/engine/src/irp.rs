//! I/O request packets
//!
//! An [`Irp`] bundles a data buffer, the transfer parameters and the outcome
//! of the most recent activation. Handles are cheap clones sharing a single
//! identity; the pipe holds one while the IRP is active.
//!
//! # State machine
//!
//! ```text
//! Idle ──submit──> Active ──completion──> Completed(Ok|Err)
//!                    ^                         │
//!                    └──────resubmit───────────┤
//!                                              └──> Terminal (no resubmit)
//! ```
//!
//! Submission is only valid while the IRP is not active. Each activation is
//! finalized exactly once by the owning pipe's completion worker.

use crate::control::ControlRequest;
use crate::error::{PipeError, Result};
use crate::policy::{AlwaysFire, CopyBuffer, EventPolicy, ResubmitDataPolicy, ResubmitErrorPolicy, StopOnError};
use crate::sync::{lock, wait_timeout_while, wait_while};
use protocol::UsbError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::warn;

static NEXT_IRP_ID: AtomicU64 = AtomicU64::new(1);

/// Read-only view shared by plain and composite IRPs
///
/// Policies receive a `&dyn UsbIrp` so the same policy type can serve both.
pub trait UsbIrp: Send + Sync {
    /// Copy of the data buffer (for a composite, the concatenated transferred bytes)
    fn data(&self) -> Vec<u8>;
    /// Bytes transferred by the last activation
    fn actual_length(&self) -> usize;
    /// Error of the last activation, if it failed
    fn error(&self) -> Option<UsbError>;
    /// Sequence number of the current or last activation (0 if never submitted)
    fn sequence_number(&self) -> u64;
    fn is_active(&self) -> bool;
    fn is_complete(&self) -> bool;
    fn accepts_short_packet(&self) -> bool;
    /// Block until the IRP completes or `timeout` elapses
    ///
    /// `None` or a zero timeout waits indefinitely. Returns whether a
    /// completion was observed.
    fn wait_until_complete(&self, timeout: Option<Duration>) -> bool;
}

#[derive(Debug)]
struct IrpState {
    data: Vec<u8>,
    offset: usize,
    /// Requested length; `None` means the remaining buffer after `offset`
    length: Option<usize>,
    /// Length resolved at submission time
    requested: usize,
    actual_length: usize,
    accept_short_packet: bool,
    active: bool,
    completed: bool,
    error: Option<UsbError>,
    sequence_number: u64,
    /// Bumped when a finalized activation is published to waiters
    completions: u64,
    /// The last finalized activation has been published
    settled: bool,
    /// Result of the last finalized activation, kept across re-arming
    outcome: Outcome,
    resubmit: bool,
}

/// Result of one finalized activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Outcome {
    pub actual_length: usize,
    pub error: Option<UsbError>,
}

impl Outcome {
    pub fn into_result(self) -> Result<usize> {
        match self.error {
            Some(error) => Err(PipeError::Transfer(error)),
            None => Ok(self.actual_length),
        }
    }
}

impl IrpState {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            offset: 0,
            length: None,
            requested: 0,
            actual_length: 0,
            accept_short_packet: true,
            active: false,
            completed: false,
            error: None,
            sequence_number: 0,
            completions: 0,
            settled: false,
            outcome: Outcome::default(),
            resubmit: false,
        }
    }

    fn resolved_length(&self) -> usize {
        self.length
            .unwrap_or_else(|| self.data.len().saturating_sub(self.offset))
    }

    fn check_bounds(&self) -> Result<()> {
        let length = self.resolved_length();
        match self.offset.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(PipeError::InvalidArgument(format!(
                "offset {} + length {} exceeds buffer of {} bytes",
                self.offset,
                length,
                self.data.len()
            ))),
        }
    }

    fn ensure_inactive(&self) -> Result<()> {
        if self.active {
            Err(PipeError::IrpActive)
        } else {
            Ok(())
        }
    }
}

struct IrpPolicies {
    resubmit_data: Arc<dyn ResubmitDataPolicy>,
    resubmit_error: Arc<dyn ResubmitErrorPolicy>,
    event: Arc<dyn EventPolicy>,
}

impl Default for IrpPolicies {
    fn default() -> Self {
        Self {
            resubmit_data: Arc::new(CopyBuffer),
            resubmit_error: Arc::new(StopOnError),
            event: Arc::new(AlwaysFire),
        }
    }
}

struct IrpInner {
    id: u64,
    control: Option<ControlRequest>,
    state: Mutex<IrpState>,
    completion: Condvar,
    policies: Mutex<IrpPolicies>,
}

/// Parameters moved out of an IRP when it is handed to the transport
pub(crate) struct TransferParts {
    pub buffer: Vec<u8>,
    pub offset: usize,
    pub length: usize,
    pub accept_short_packet: bool,
}

/// A single transfer request
#[derive(Clone)]
pub struct Irp {
    inner: Arc<IrpInner>,
}

impl Irp {
    /// Create an idle IRP covering the whole buffer, accepting short packets
    pub fn new(data: Vec<u8>) -> Self {
        Self::build(data, None)
    }

    /// Create an idle IRP over `data[offset..offset + length]`
    pub fn with_range(
        data: Vec<u8>,
        offset: usize,
        length: usize,
        accept_short_packet: bool,
    ) -> Result<Self> {
        let irp = Self::new(data);
        {
            let mut state = irp.lock_state();
            state.offset = offset;
            state.length = Some(length);
            state.accept_short_packet = accept_short_packet;
            state.check_bounds()?;
        }
        Ok(irp)
    }

    pub(crate) fn build(data: Vec<u8>, control: Option<ControlRequest>) -> Self {
        Self {
            inner: Arc::new(IrpInner {
                id: NEXT_IRP_ID.fetch_add(1, Ordering::Relaxed),
                control,
                state: Mutex::new(IrpState::new(data)),
                completion: Condvar::new(),
                policies: Mutex::new(IrpPolicies::default()),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, IrpState> {
        lock(&self.inner.state)
    }

    /// Process-unique identity, stable across resubmissions
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether two handles refer to the same IRP
    pub fn ptr_eq(&self, other: &Irp) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Control setup fields, present for IRPs built by [`crate::ControlIrp`]
    pub fn control_request(&self) -> Option<ControlRequest> {
        self.inner.control
    }

    /// Copy of the whole data buffer
    ///
    /// While active the buffer belongs to the transport and this is empty.
    pub fn data(&self) -> Vec<u8> {
        self.lock_state().data.clone()
    }

    /// Copy of the bytes transferred by the last activation
    pub fn transferred_data(&self) -> Vec<u8> {
        let state = self.lock_state();
        if state.active {
            return Vec::new();
        }
        let start = state.offset.min(state.data.len());
        let end = (start + state.actual_length).min(state.data.len());
        state.data[start..end].to_vec()
    }

    /// Size of the data buffer (0 while active)
    pub fn buffer_len(&self) -> usize {
        self.lock_state().data.len()
    }

    pub fn offset(&self) -> usize {
        self.lock_state().offset
    }

    /// Requested transfer length
    ///
    /// Resolved at submission time while active; otherwise the explicit
    /// length, or the remaining buffer after the offset when none is set.
    pub fn length(&self) -> usize {
        let state = self.lock_state();
        if state.active {
            state.requested
        } else {
            state.resolved_length()
        }
    }

    pub fn actual_length(&self) -> usize {
        self.lock_state().actual_length
    }

    pub fn error(&self) -> Option<UsbError> {
        self.lock_state().error
    }

    pub fn is_error(&self) -> bool {
        self.lock_state().error.is_some()
    }

    pub fn accepts_short_packet(&self) -> bool {
        self.lock_state().accept_short_packet
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().active
    }

    pub fn is_complete(&self) -> bool {
        self.lock_state().completed
    }

    pub fn sequence_number(&self) -> u64 {
        self.lock_state().sequence_number
    }

    /// Whether automatic resubmission is enabled
    pub fn resubmit(&self) -> bool {
        self.lock_state().resubmit
    }

    /// Replace the data buffer
    pub fn set_data(&self, data: Vec<u8>) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        state.data = data;
        Ok(())
    }

    pub fn set_offset(&self, offset: usize) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        state.offset = offset;
        Ok(())
    }

    /// Set the requested length; `None` uses the remaining buffer at submission
    pub fn set_length(&self, length: Option<usize>) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        state.length = length;
        Ok(())
    }

    pub fn set_accept_short_packet(&self, accept: bool) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        state.accept_short_packet = accept;
        Ok(())
    }

    /// Enable or disable automatic resubmission
    ///
    /// Ignored while the IRP is driven by a composite.
    pub fn set_resubmit(&self, resubmit: bool) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        state.resubmit = resubmit;
        Ok(())
    }

    pub fn set_resubmit_data_policy(&self, policy: impl ResubmitDataPolicy + 'static) {
        lock(&self.inner.policies).resubmit_data = Arc::new(policy);
    }

    pub fn set_resubmit_error_policy(&self, policy: impl ResubmitErrorPolicy + 'static) {
        lock(&self.inner.policies).resubmit_error = Arc::new(policy);
    }

    pub fn set_event_policy(&self, policy: impl EventPolicy + 'static) {
        lock(&self.inner.policies).event = Arc::new(policy);
    }

    /// Reset an inactive IRP to idle, dropping its buffer and results
    ///
    /// Policies and the short-packet setting are kept.
    pub fn recycle(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        let accept_short_packet = state.accept_short_packet;
        let completions = state.completions;
        *state = IrpState::new(Vec::new());
        state.accept_short_packet = accept_short_packet;
        state.completions = completions;
        Ok(())
    }

    /// Block until the IRP completes or `timeout` elapses
    ///
    /// `None` or a zero timeout waits indefinitely. Returns `true` if the IRP
    /// was already complete or a completion was observed while waiting; a
    /// completion immediately followed by an automatic resubmission counts.
    pub fn wait_until_complete(&self, timeout: Option<Duration>) -> bool {
        let state = self.lock_state();
        if state.completed && state.settled {
            return true;
        }
        let observed = state.completions;
        drop(state);
        self.wait_for_completion_after(observed, timeout).is_some()
    }

    pub(crate) fn completion_count(&self) -> u64 {
        self.lock_state().completions
    }

    /// Wait until more than `observed` activations have been finalized
    ///
    /// Returns the outcome of the latest one, or `None` on timeout.
    pub(crate) fn wait_for_completion_after(
        &self,
        observed: u64,
        timeout: Option<Duration>,
    ) -> Option<Outcome> {
        let state = self.lock_state();
        let pending = |s: &mut IrpState| s.completions == observed;
        let state = match timeout.filter(|t| !t.is_zero()) {
            None => wait_while(&self.inner.completion, state, pending),
            Some(timeout) => wait_timeout_while(&self.inner.completion, state, timeout, pending).0,
        };
        (state.completions != observed).then_some(state.outcome)
    }

    /// Block until an activation after `observed` has been finalized
    pub(crate) fn wait_for_completion(&self, observed: u64) -> Outcome {
        let state = self.lock_state();
        wait_while(&self.inner.completion, state, |s| s.completions == observed).outcome
    }

    /// Move Idle/Terminal → Active with a fresh sequence number
    pub(crate) fn arm(&self, sequence_number: u64) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        state.check_bounds()?;
        state.requested = state.resolved_length();
        state.active = true;
        state.completed = false;
        state.settled = false;
        state.error = None;
        state.actual_length = 0;
        state.sequence_number = sequence_number;
        Ok(())
    }

    /// Undo an [`Irp::arm`] for a submission that was rejected before dispatch
    pub(crate) fn disarm(&self) {
        self.lock_state().active = false;
    }

    /// Hand the buffer to the transport
    pub(crate) fn take_transfer(&self) -> TransferParts {
        let mut state = self.lock_state();
        TransferParts {
            buffer: std::mem::take(&mut state.data),
            offset: state.offset,
            length: state.requested,
            accept_short_packet: state.accept_short_packet,
        }
    }

    /// Finalize the current activation; returns the classified error
    ///
    /// `buffer` is `None` when the IRP never reached the transport and still
    /// owns its data.
    pub(crate) fn finish(
        &self,
        buffer: Option<Vec<u8>>,
        actual_length: usize,
        error: Option<UsbError>,
    ) -> Option<UsbError> {
        let mut state = self.lock_state();
        if let Some(buffer) = buffer {
            state.data = buffer;
        }

        let mut actual = actual_length;
        if actual > state.requested {
            warn!(
                "IRP {} reported {} bytes for a {} byte request, clamping",
                self.inner.id, actual, state.requested
            );
            actual = state.requested;
        }

        let mut error = error;
        if error.is_none() && actual < state.requested && !state.accept_short_packet {
            error = Some(UsbError::IncompleteTransfer);
        }

        state.actual_length = actual;
        state.error = error;
        state.active = false;
        state.completed = true;
        state.outcome = Outcome {
            actual_length: actual,
            error,
        };
        error
    }

    /// Publish the finalized activation and wake every waiter
    ///
    /// Called once per activation, after its event fired and its
    /// resubmission was decided.
    pub(crate) fn notify_waiters(&self) {
        let mut state = self.lock_state();
        state.completions += 1;
        state.settled = true;
        drop(state);
        self.inner.completion.notify_all();
    }

    pub(crate) fn disable_resubmit(&self) {
        self.lock_state().resubmit = false;
    }

    /// Replace the buffer between activations (resubmission path)
    pub(crate) fn replace_data(&self, data: Vec<u8>) {
        self.lock_state().data = data;
    }

    pub(crate) fn resubmit_data_policy(&self) -> Arc<dyn ResubmitDataPolicy> {
        lock(&self.inner.policies).resubmit_data.clone()
    }

    pub(crate) fn resubmit_error_policy(&self) -> Arc<dyn ResubmitErrorPolicy> {
        lock(&self.inner.policies).resubmit_error.clone()
    }

    pub(crate) fn event_policy(&self) -> Arc<dyn EventPolicy> {
        lock(&self.inner.policies).event.clone()
    }
}

impl Default for Irp {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for Irp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Irp")
            .field("id", &self.inner.id)
            .field("control", &self.inner.control)
            .field("buffer_len", &state.data.len())
            .field("offset", &state.offset)
            .field("length", &state.length)
            .field("actual_length", &state.actual_length)
            .field("active", &state.active)
            .field("completed", &state.completed)
            .field("error", &state.error)
            .field("sequence_number", &state.sequence_number)
            .finish()
    }
}

impl UsbIrp for Irp {
    fn data(&self) -> Vec<u8> {
        Irp::data(self)
    }

    fn actual_length(&self) -> usize {
        Irp::actual_length(self)
    }

    fn error(&self) -> Option<UsbError> {
        Irp::error(self)
    }

    fn sequence_number(&self) -> u64 {
        Irp::sequence_number(self)
    }

    fn is_active(&self) -> bool {
        Irp::is_active(self)
    }

    fn is_complete(&self) -> bool {
        Irp::is_complete(self)
    }

    fn accepts_short_packet(&self) -> bool {
        Irp::accepts_short_packet(self)
    }

    fn wait_until_complete(&self, timeout: Option<Duration>) -> bool {
        Irp::wait_until_complete(self, timeout)
    }
}
