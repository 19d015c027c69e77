//! Composite IRPs
//!
//! A [`CompositeIrp`] groups child IRPs that are submitted and completed as a
//! single unit. Children reach the transport strictly in list order, one at a
//! time, and the pipe keeps other work out of the composite's delivery window.
//!
//! The composite's own resubmit flag and policies govern resubmission; the
//! children's settings are ignored while they belong to an active composite.

use crate::error::{PipeError, Result};
use crate::irp::{Irp, Outcome, UsbIrp};
use crate::policy::{
    CompositeErrorCommand, EventPolicy, KeepBuffer, NeverFire, ResubmitDataPolicy,
    ResubmitErrorPolicy, StopOnError, StopSubmissions,
};
use crate::sync::{lock, wait_timeout_while, wait_while};
use protocol::UsbError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct CompositeState {
    children: Vec<Irp>,
    active: bool,
    completed: bool,
    error: Option<UsbError>,
    sequence_number: u64,
    completions: u64,
    /// The last finalized activation has been published
    settled: bool,
    outcome: Outcome,
    resubmit: bool,
}

impl CompositeState {
    fn ensure_inactive(&self) -> Result<()> {
        if self.active {
            Err(PipeError::IrpActive)
        } else {
            Ok(())
        }
    }
}

struct CompositePolicies {
    resubmit_data: Arc<dyn ResubmitDataPolicy>,
    resubmit_error: Arc<dyn ResubmitErrorPolicy>,
    event: Arc<dyn EventPolicy>,
    error_command: Arc<dyn CompositeErrorCommand>,
}

impl Default for CompositePolicies {
    fn default() -> Self {
        Self {
            resubmit_data: Arc::new(KeepBuffer),
            resubmit_error: Arc::new(StopOnError),
            event: Arc::new(NeverFire),
            error_command: Arc::new(StopSubmissions),
        }
    }
}

struct CompositeInner {
    state: Mutex<CompositeState>,
    completion: Condvar,
    policies: Mutex<CompositePolicies>,
}

/// Ordered aggregate of child IRPs
#[derive(Clone)]
pub struct CompositeIrp {
    inner: Arc<CompositeInner>,
}

impl CompositeIrp {
    pub fn new(children: Vec<Irp>) -> Self {
        Self {
            inner: Arc::new(CompositeInner {
                state: Mutex::new(CompositeState {
                    children,
                    ..CompositeState::default()
                }),
                completion: Condvar::new(),
                policies: Mutex::new(CompositePolicies::default()),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CompositeState> {
        lock(&self.inner.state)
    }

    pub fn ptr_eq(&self, other: &CompositeIrp) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Handles to the children, in submission order
    pub fn children(&self) -> Vec<Irp> {
        self.lock_state().children.clone()
    }

    pub fn len(&self) -> usize {
        self.lock_state().children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().children.is_empty()
    }

    /// Append a child
    pub fn push(&self, irp: Irp) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        state.children.push(irp);
        Ok(())
    }

    /// Replace all children
    pub fn set_children(&self, children: Vec<Irp>) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        state.children = children;
        Ok(())
    }

    /// Concatenation of every child's transferred bytes, in list order
    ///
    /// Built fresh on each call.
    pub fn data(&self) -> Vec<u8> {
        let children = self.children();
        let mut data = Vec::with_capacity(children.iter().map(Irp::actual_length).sum());
        for child in &children {
            data.extend_from_slice(&child.transferred_data());
        }
        data
    }

    /// Redistribute `data` over the children
    ///
    /// The buffer is cut into contiguous slices sized by each child's current
    /// buffer, in list order. Its length must equal the children's total.
    pub fn set_data(&self, data: Vec<u8>) -> Result<()> {
        let state = self.lock_state();
        state.ensure_inactive()?;

        let sizes: Vec<usize> = state.children.iter().map(Irp::buffer_len).collect();
        let total: usize = sizes.iter().sum();
        if data.len() != total {
            return Err(PipeError::InvalidArgument(format!(
                "composite buffer is {} bytes, children hold {}",
                data.len(),
                total
            )));
        }
        if state.children.iter().any(Irp::is_active) {
            return Err(PipeError::IrpActive);
        }

        let mut start = 0;
        for (child, size) in state.children.iter().zip(sizes) {
            child.set_data(data[start..start + size].to_vec())?;
            start += size;
        }
        Ok(())
    }

    /// Sum of the children's transferred lengths
    pub fn actual_length(&self) -> usize {
        self.children().iter().map(Irp::actual_length).sum()
    }

    pub fn error(&self) -> Option<UsbError> {
        self.lock_state().error
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().active
    }

    /// Whether the last activation finished (every child is then complete)
    pub fn is_complete(&self) -> bool {
        self.lock_state().completed
    }

    pub fn sequence_number(&self) -> u64 {
        self.lock_state().sequence_number
    }

    /// True only if every child accepts short packets
    pub fn accepts_short_packet(&self) -> bool {
        self.children().iter().all(Irp::accepts_short_packet)
    }

    /// Apply the short-packet setting to every child
    pub fn set_accept_short_packet(&self, accept: bool) -> Result<()> {
        let state = self.lock_state();
        state.ensure_inactive()?;
        for child in &state.children {
            child.set_accept_short_packet(accept)?;
        }
        Ok(())
    }

    pub fn resubmit(&self) -> bool {
        self.lock_state().resubmit
    }

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

    pub fn set_error_command(&self, command: impl CompositeErrorCommand + 'static) {
        lock(&self.inner.policies).error_command = Arc::new(command);
    }

    /// Block until the composite completes or `timeout` elapses
    ///
    /// Same contract as [`Irp::wait_until_complete`].
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

    pub(crate) fn wait_for_completion_after(
        &self,
        observed: u64,
        timeout: Option<Duration>,
    ) -> Option<Outcome> {
        let state = self.lock_state();
        let pending = |s: &mut CompositeState| s.completions == observed;
        let state = match timeout.filter(|t| !t.is_zero()) {
            None => wait_while(&self.inner.completion, state, pending),
            Some(timeout) => wait_timeout_while(&self.inner.completion, state, timeout, pending).0,
        };
        (state.completions != observed).then_some(state.outcome)
    }

    /// Block until an run after `observed` has been finalized
    pub(crate) fn wait_for_completion(&self, observed: u64) -> Outcome {
        let state = self.lock_state();
        wait_while(&self.inner.completion, state, |s| s.completions == observed).outcome
    }

    /// Arm the composite and every child
    ///
    /// `sequence_numbers` yields the composite's number first, then one per
    /// child. Returns the armed children. On failure nothing stays armed.
    pub(crate) fn arm(&self, mut sequence_numbers: impl FnMut() -> u64) -> Result<Vec<Irp>> {
        let mut state = self.lock_state();
        state.ensure_inactive()?;
        if state.children.is_empty() {
            return Err(PipeError::InvalidArgument(
                "composite has no children".to_string(),
            ));
        }

        let sequence_number = sequence_numbers();
        let mut armed: Vec<&Irp> = Vec::with_capacity(state.children.len());
        for child in &state.children {
            if let Err(e) = child.arm(sequence_numbers()) {
                for irp in armed {
                    irp.disarm();
                }
                return Err(e);
            }
            armed.push(child);
        }

        state.active = true;
        state.completed = false;
        state.settled = false;
        state.error = None;
        state.sequence_number = sequence_number;
        Ok(state.children.clone())
    }

    pub(crate) fn disarm(&self) {
        let mut state = self.lock_state();
        for child in &state.children {
            child.disarm();
        }
        state.active = false;
    }

    /// Finalize the current activation
    pub(crate) fn finish(&self, error: Option<UsbError>) {
        let actual_length = self.actual_length();
        let mut state = self.lock_state();
        state.active = false;
        state.completed = true;
        state.error = error;
        state.outcome = Outcome {
            actual_length,
            error,
        };
    }

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

    pub(crate) fn resubmit_data_policy(&self) -> Arc<dyn ResubmitDataPolicy> {
        lock(&self.inner.policies).resubmit_data.clone()
    }

    pub(crate) fn resubmit_error_policy(&self) -> Arc<dyn ResubmitErrorPolicy> {
        lock(&self.inner.policies).resubmit_error.clone()
    }

    pub(crate) fn event_policy(&self) -> Arc<dyn EventPolicy> {
        lock(&self.inner.policies).event.clone()
    }

    pub(crate) fn error_command(&self) -> Arc<dyn CompositeErrorCommand> {
        lock(&self.inner.policies).error_command.clone()
    }
}

impl std::fmt::Debug for CompositeIrp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CompositeIrp")
            .field("children", &state.children.len())
            .field("active", &state.active)
            .field("completed", &state.completed)
            .field("error", &state.error)
            .field("sequence_number", &state.sequence_number)
            .finish()
    }
}

impl UsbIrp for CompositeIrp {
    fn data(&self) -> Vec<u8> {
        CompositeIrp::data(self)
    }

    fn actual_length(&self) -> usize {
        CompositeIrp::actual_length(self)
    }

    fn error(&self) -> Option<UsbError> {
        CompositeIrp::error(self)
    }

    fn sequence_number(&self) -> u64 {
        CompositeIrp::sequence_number(self)
    }

    fn is_active(&self) -> bool {
        CompositeIrp::is_active(self)
    }

    fn is_complete(&self) -> bool {
        CompositeIrp::is_complete(self)
    }

    fn accepts_short_packet(&self) -> bool {
        CompositeIrp::accepts_short_packet(self)
    }

    fn wait_until_complete(&self, timeout: Option<Duration>) -> bool {
        CompositeIrp::wait_until_complete(self, timeout)
    }
}
