//! Pipe completion worker
//!
//! Dedicated thread per pipe that serializes all completion processing.
//! Transport threads only enqueue [`PipeCommand`]s through [`PipeSink`]; the
//! worker finalizes results, fires events, runs policies, re-dispatches
//! resubmissions and advances composites, in that order.
//!
//! Listeners and policies run here with no pipe lock held. When the pipe is
//! dropped the worker cancels whatever it still owns before exiting.

use crate::composite::CompositeIrp;
use crate::events::guarded;
use crate::irp::{Irp, UsbIrp};
use crate::pipe::{Dispatched, PipeShared, Unit};
use crate::policy::EventPolicy;
use crate::sync::lock;
use crate::transport::{CompletionSink, TransferCompletion};
use async_channel::{Receiver, Sender};
use protocol::{DataEvent, ErrorEvent, PipeEvent, UsbError};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, trace, warn};

/// Work item for the completion worker
pub(crate) enum PipeCommand {
    /// A transport reported a completion
    Complete(TransferCompletion),
    /// The transport refused to start a transfer
    Rejected {
        dispatched: Dispatched,
        buffer: Vec<u8>,
        error: UsbError,
    },
    /// A queued unit removed by an abort before it reached the transport
    Cancel(Unit),
    Shutdown,
}

/// Sink handed to the transport with every request
pub(crate) struct PipeSink {
    commands: Sender<PipeCommand>,
}

impl PipeSink {
    pub fn new(commands: Sender<PipeCommand>) -> Self {
        Self { commands }
    }
}

impl CompletionSink for PipeSink {
    fn on_transfer_complete(&self, completion: TransferCompletion) {
        let handle = completion.handle;
        if self
            .commands
            .try_send(PipeCommand::Complete(completion))
            .is_err()
        {
            debug!("Pipe gone, {:?} was already cancelled", handle);
        }
    }
}

pub(crate) struct CompletionWorker {
    shared: Arc<PipeShared>,
    commands: Receiver<PipeCommand>,
}

impl CompletionWorker {
    pub fn new(shared: Arc<PipeShared>, commands: Receiver<PipeCommand>) -> Self {
        Self { shared, commands }
    }

    /// Process commands until shutdown
    pub fn run(self) {
        let _ = self.shared.worker_thread.set(thread::current().id());
        info!(
            "Completion worker for pipe {} started",
            self.shared.endpoint.address
        );

        loop {
            match self.commands.recv_blocking() {
                Ok(PipeCommand::Shutdown) | Err(_) => break,
                Ok(command) => self.handle_command(command),
            }
        }
        self.cancel_stranded();

        info!(
            "Completion worker for pipe {} stopped",
            self.shared.endpoint.address
        );
    }

    /// Finalize everything the pipe still owns as `Cancelled`
    ///
    /// Runs once the pipe is gone. Completions already queued are processed
    /// first; later ones find the channel closed. Buffers of transfers still
    /// in flight stay with the transport.
    fn cancel_stranded(&self) {
        let pending = {
            let mut state = lock(&self.shared.state);
            state.aborting = true;
            std::mem::take(&mut state.pending)
        };
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if !matches!(command, PipeCommand::Shutdown) {
                self.handle_command(command);
            }
        }

        let (inflight, gate) = {
            let mut state = lock(&self.shared.state);
            (std::mem::take(&mut state.inflight), state.gate.take())
        };
        if pending.is_empty() && inflight.is_empty() && gate.is_none() {
            return;
        }
        warn!(
            "Pipe {} dropped with work outstanding: {} queued, {} in flight",
            self.shared.endpoint.address,
            pending.len(),
            inflight.len()
        );

        for (handle, dispatched) in inflight {
            self.shared.transport.cancel(handle);
            let cancelled = Some(UsbError::Cancelled);
            if dispatched.composite_child {
                self.finish_child(&dispatched.irp, None, 0, cancelled);
            } else {
                self.handle_command(PipeCommand::Cancel(Unit::Irp(dispatched.irp)));
            }
        }
        if let Some(run) = gate {
            for skipped in &run.children[run.next..] {
                skip_child(skipped);
            }
            self.complete_composite(&run.composite, Some(UsbError::Cancelled));
        }
        for unit in pending {
            self.handle_command(PipeCommand::Cancel(unit));
        }
    }

    fn handle_command(&self, command: PipeCommand) {
        // Keep the worker alive whatever a listener or policy does
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(command)
        }));

        if let Err(e) = result {
            error!("Panic in completion handler: {:?}", e);
        }
    }

    fn handle_command_inner(&self, command: PipeCommand) {
        match command {
            PipeCommand::Complete(completion) => {
                let dispatched = lock(&self.shared.state)
                    .inflight
                    .remove(&completion.handle);
                match dispatched {
                    Some(dispatched) => self.transfer_finished(
                        dispatched,
                        Some(completion.buffer),
                        completion.actual_length,
                        completion.error,
                    ),
                    None => warn!(
                        "Ignoring completion for unknown transfer {:?}",
                        completion.handle
                    ),
                }
            }

            PipeCommand::Rejected {
                dispatched,
                buffer,
                error,
            } => self.transfer_finished(dispatched, Some(buffer), 0, Some(error)),

            PipeCommand::Cancel(Unit::Irp(irp)) => {
                self.complete_irp(&irp, None, 0, Some(UsbError::Cancelled));
            }

            PipeCommand::Cancel(Unit::Composite(composite)) => {
                for child in composite.children() {
                    skip_child(&child);
                }
                self.complete_composite(&composite, Some(UsbError::Cancelled));
            }

            PipeCommand::Shutdown => {
                // Already handled in run()
            }
        }
    }

    fn transfer_finished(
        &self,
        dispatched: Dispatched,
        buffer: Option<Vec<u8>>,
        actual_length: usize,
        error: Option<UsbError>,
    ) {
        if dispatched.composite_child {
            self.complete_child(&dispatched.irp, buffer, actual_length, error);
        } else {
            self.complete_irp(&dispatched.irp, buffer, actual_length, error);
        }
    }

    /// Finalize a plain IRP, fire its event, then resubmit or retire it
    fn complete_irp(
        &self,
        irp: &Irp,
        buffer: Option<Vec<u8>>,
        actual_length: usize,
        error: Option<UsbError>,
    ) {
        let error = irp.finish(buffer, actual_length, error);
        trace!(
            "IRP seq={} finished: {} bytes, error={:?}",
            irp.sequence_number(),
            irp.actual_length(),
            error
        );
        self.fire_event(irp, irp.event_policy(), error, || irp.transferred_data());

        let resubmit = irp_wants_resubmit(irp, error);

        let mut state = lock(&self.shared.state);
        let resubmitted = resubmit
            && match self
                .shared
                .check_accepting(&state)
                .and_then(|_| self.shared.arm_irp(irp))
            {
                Ok(()) => true,
                Err(e) => {
                    debug!("Resubmission of IRP {} rejected: {}", irp.id(), e);
                    false
                }
            };

        if resubmitted {
            self.shared.enqueue(&mut state, Unit::Irp(irp.clone()));
        } else {
            state.active_units = state.active_units.saturating_sub(1);
        }
        drop(state);

        self.shared.idle.notify_all();
        irp.notify_waiters();
    }

    /// Finalize a composite child and dispatch the next one or finish
    fn complete_child(
        &self,
        child: &Irp,
        buffer: Option<Vec<u8>>,
        actual_length: usize,
        error: Option<UsbError>,
    ) {
        let error = self.finish_child(child, buffer, actual_length, error);

        let (composite, aborting) = {
            let state = lock(&self.shared.state);
            match state.gate.as_ref() {
                Some(run) => (run.composite.clone(), state.aborting),
                None => {
                    warn!("Composite child completed without an active composite");
                    return;
                }
            }
        };

        let mut failure = None;
        if let Some(error) = error {
            let command = composite.error_command();
            let proceed = !aborting
                && guarded("composite error command", false, || {
                    command.continue_submissions(&composite, child)
                });
            if proceed {
                debug!(
                    "Composite seq={} tolerating child seq={} error {}",
                    composite.sequence_number(),
                    child.sequence_number(),
                    error
                );
            } else {
                failure = Some(error);
            }
        }

        let mut state = lock(&self.shared.state);
        let remaining = state
            .gate
            .as_ref()
            .is_some_and(|run| run.next < run.children.len());
        if state.aborting && failure.is_none() && remaining {
            failure = Some(UsbError::Cancelled);
        }

        let next = match state.gate.as_mut() {
            Some(run) if failure.is_none() && run.next < run.children.len() => {
                let next = run.children[run.next].clone();
                run.next += 1;
                Some(next)
            }
            _ => None,
        };
        if let Some(next) = next {
            self.shared.dispatch(&mut state, next, true);
            return;
        }

        let Some(run) = state.gate.take() else {
            return;
        };
        drop(state);

        for skipped in &run.children[run.next..] {
            skip_child(skipped);
        }
        self.complete_composite(&run.composite, failure);
    }

    /// Finalize a dispatched child and fire its event
    fn finish_child(
        &self,
        child: &Irp,
        buffer: Option<Vec<u8>>,
        actual_length: usize,
        error: Option<UsbError>,
    ) -> Option<UsbError> {
        let error = child.finish(buffer, actual_length, error);
        self.fire_event(child, child.event_policy(), error, || child.transferred_data());
        child.notify_waiters();
        error
    }

    /// Finalize a composite, release the gate and resubmit or retire it
    fn complete_composite(&self, composite: &CompositeIrp, error: Option<UsbError>) {
        composite.finish(error);
        trace!(
            "Composite seq={} finished: {} bytes, error={:?}",
            composite.sequence_number(),
            composite.actual_length(),
            error
        );
        self.fire_event(composite, composite.event_policy(), error, || composite.data());

        let resubmit = composite_wants_resubmit(composite, error);

        let mut state = lock(&self.shared.state);
        let resubmitted = resubmit
            && match self
                .shared
                .check_accepting(&state)
                .and_then(|_| composite.arm(|| self.shared.next_sequence()).map(|_| ()))
            {
                Ok(()) => true,
                Err(e) => {
                    debug!("Composite resubmission rejected: {}", e);
                    false
                }
            };

        if resubmitted {
            state.pending.push_back(Unit::Composite(composite.clone()));
        } else {
            state.active_units = state.active_units.saturating_sub(1);
        }
        self.shared.drain_pending(&mut state);
        drop(state);

        self.shared.idle.notify_all();
        composite.notify_waiters();
    }

    /// Consult the event policy and deliver the event to listeners
    fn fire_event(
        &self,
        irp: &dyn UsbIrp,
        policy: Arc<dyn EventPolicy>,
        error: Option<UsbError>,
        data: impl FnOnce() -> Vec<u8>,
    ) {
        if !guarded("event policy", true, || policy.fire_event(irp)) {
            return;
        }
        if self.shared.listeners.is_empty() {
            return;
        }

        let endpoint = self.shared.endpoint.address;
        let sequence_number = irp.sequence_number();
        let event = match error {
            Some(error) => PipeEvent::Error(ErrorEvent {
                endpoint,
                sequence_number,
                error,
            }),
            None => PipeEvent::Data(DataEvent {
                endpoint,
                sequence_number,
                data: data(),
            }),
        };
        self.shared.listeners.dispatch(&event);
    }
}

/// Finalize a child that never reached the transport; no event fires
fn skip_child(child: &Irp) {
    child.finish(None, 0, Some(UsbError::Cancelled));
    child.notify_waiters();
}

fn irp_wants_resubmit(irp: &Irp, error: Option<UsbError>) -> bool {
    if !irp.resubmit() {
        return false;
    }
    match error {
        Some(_) => {
            let policy = irp.resubmit_error_policy();
            let retry = guarded("resubmit error policy", false, || policy.resubmit_on_error(irp));
            if !retry {
                irp.disable_resubmit();
            }
            retry
        }
        None => {
            let policy = irp.resubmit_data_policy();
            if let Some(data) = guarded("resubmit data policy", None, || policy.resubmit_data(irp)) {
                irp.replace_data(data);
            }
            true
        }
    }
}

fn composite_wants_resubmit(composite: &CompositeIrp, error: Option<UsbError>) -> bool {
    if !composite.resubmit() {
        return false;
    }
    match error {
        Some(_) => {
            let policy = composite.resubmit_error_policy();
            let retry = guarded("resubmit error policy", false, || {
                policy.resubmit_on_error(composite)
            });
            if !retry {
                composite.disable_resubmit();
            }
            retry
        }
        None => {
            let policy = composite.resubmit_data_policy();
            if let Some(data) = guarded("resubmit data policy", None, || policy.resubmit_data(composite)) {
                if let Err(e) = composite.set_data(data) {
                    warn!("Keeping composite buffers, resubmit data rejected: {}", e);
                }
            }
            true
        }
    }
}
