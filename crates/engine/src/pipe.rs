//! Pipes
//!
//! A [`Pipe`] binds an endpoint to a transport. It enforces the open/close
//! lifecycle, assigns sequence numbers, keeps submission order and hands
//! every completion to its dedicated completion worker (see
//! [`crate::worker`]).
//!
//! # Locking
//!
//! Open/close and submit/abort are independent domains. Lock order is
//! `open_lock` → `state` → IRP internals. The submission state lock is held
//! across `Transport::begin_transfer`, which is what keeps a list or
//! composite contiguous at the transport without serializing transfers that
//! are already in flight.

use crate::composite::CompositeIrp;
use crate::error::{PipeError, Result};
use crate::events::{ListenerId, ListenerSet, PipeListener};
use crate::irp::Irp;
use crate::sync::{lock, wait_while};
use crate::transport::{
    BeginError, CompletionSink, Scope, TransferHandle, TransferRequest, Transport,
};
use crate::worker::{CompletionWorker, PipeCommand, PipeSink};
use async_channel::Sender;
use protocol::{Endpoint, ScopeId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, trace, warn};

/// A submission unit as queued by the pipe
pub(crate) enum Unit {
    Irp(Irp),
    Composite(CompositeIrp),
}

/// An IRP currently owned by the transport
pub(crate) struct Dispatched {
    pub irp: Irp,
    /// Child of the composite holding the submission gate
    pub composite_child: bool,
}

/// The composite currently holding the submission gate
pub(crate) struct CompositeRun {
    pub composite: CompositeIrp,
    pub children: Vec<Irp>,
    /// Index of the next child to dispatch
    pub next: usize,
}

#[derive(Default)]
pub(crate) struct SubmissionState {
    /// Units waiting for the gate to be released
    pub pending: VecDeque<Unit>,
    pub gate: Option<CompositeRun>,
    pub inflight: HashMap<TransferHandle, Dispatched>,
    /// Submitted units that have not reached a terminal completion
    pub active_units: usize,
    pub aborting: bool,
}

pub(crate) struct PipeShared {
    pub endpoint: Endpoint,
    scope: ScopeId,
    scopes: Arc<dyn Scope>,
    pub transport: Arc<dyn Transport>,
    sink: Arc<dyn CompletionSink>,
    commands: Sender<PipeCommand>,
    open_lock: Mutex<()>,
    open: AtomicBool,
    pub state: Mutex<SubmissionState>,
    /// Signalled whenever `active_units` drops
    pub idle: Condvar,
    abort_lock: Mutex<()>,
    pub listeners: ListenerSet,
    sequence: AtomicU64,
    pub worker_thread: OnceLock<ThreadId>,
}

impl PipeShared {
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_active(&self) -> bool {
        self.scopes.is_active(self.scope)
    }

    pub fn on_worker_thread(&self) -> bool {
        self.worker_thread.get() == Some(&thread::current().id())
    }

    fn ensure_off_worker(&self) -> Result<()> {
        if self.on_worker_thread() {
            Err(PipeError::CompletionContext)
        } else {
            Ok(())
        }
    }

    /// Whether new work may enter the pipe
    pub fn check_accepting(&self, state: &SubmissionState) -> Result<()> {
        if !self.is_active() {
            return Err(PipeError::NotActive);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(PipeError::NotOpen);
        }
        if state.aborting {
            return Err(PipeError::PipeClosed);
        }
        Ok(())
    }

    /// Arm `irp` with the next sequence number and check it fits this pipe
    pub fn arm_irp(&self, irp: &Irp) -> Result<()> {
        irp.arm(self.next_sequence())?;
        if let Err(e) = self.validate_armed(irp) {
            irp.disarm();
            return Err(e);
        }
        Ok(())
    }

    fn validate_armed(&self, irp: &Irp) -> Result<()> {
        if !self.endpoint.is_control() {
            return Ok(());
        }
        if irp.control_request().is_none() {
            return Err(PipeError::InvalidArgument(
                "control pipes only accept control IRPs".to_string(),
            ));
        }
        let length = irp.length();
        if length > u16::MAX as usize {
            return Err(PipeError::InvalidArgument(format!(
                "control transfer of {} bytes exceeds wLength",
                length
            )));
        }
        Ok(())
    }

    pub fn send(&self, command: PipeCommand) {
        if self.commands.try_send(command).is_err() {
            warn!("Completion worker for pipe {} is gone", self.endpoint.address);
        }
    }

    /// Start `unit` now, or queue it behind the gate
    pub fn enqueue(&self, state: &mut SubmissionState, unit: Unit) {
        if state.gate.is_some() || !state.pending.is_empty() {
            state.pending.push_back(unit);
        } else {
            self.start(state, unit);
        }
    }

    /// Start queued units until a composite takes the gate
    pub fn drain_pending(&self, state: &mut SubmissionState) {
        while state.gate.is_none() {
            let Some(unit) = state.pending.pop_front() else {
                break;
            };
            self.start(state, unit);
        }
    }

    fn start(&self, state: &mut SubmissionState, unit: Unit) {
        match unit {
            Unit::Irp(irp) => self.dispatch(state, irp, false),
            Unit::Composite(composite) => {
                let children = composite.children();
                let Some(first) = children.first().cloned() else {
                    self.send(PipeCommand::Cancel(Unit::Composite(composite)));
                    return;
                };
                trace!(
                    "Composite seq={} takes the gate with {} children",
                    composite.sequence_number(),
                    children.len()
                );
                state.gate = Some(CompositeRun {
                    composite,
                    children,
                    next: 1,
                });
                self.dispatch(state, first, true);
            }
        }
    }

    /// Hand an armed IRP to the transport
    pub fn dispatch(&self, state: &mut SubmissionState, irp: Irp, composite_child: bool) {
        let parts = irp.take_transfer();
        let control = irp.control_request().filter(|_| self.endpoint.is_control());
        let direction = match control {
            Some(request) => request.direction(),
            None => self.endpoint.direction(),
        };
        // Length was checked against u16 when the IRP was armed
        let setup = control
            .map(|request| request.setup_packet(u16::try_from(parts.length).unwrap_or(u16::MAX)));

        let request = TransferRequest {
            endpoint: self.endpoint.address,
            transfer_type: self.endpoint.transfer_type,
            direction,
            setup,
            buffer: parts.buffer,
            offset: parts.offset,
            length: parts.length,
            accept_short_packet: parts.accept_short_packet,
        };

        match self.transport.begin_transfer(request, self.sink.clone()) {
            Ok(handle) => {
                trace!(
                    "Dispatched seq={} on {} as {:?}",
                    irp.sequence_number(),
                    self.endpoint.address,
                    handle
                );
                state.inflight.insert(
                    handle,
                    Dispatched {
                        irp,
                        composite_child,
                    },
                );
            }
            Err(BeginError { error, buffer }) => {
                debug!(
                    "Transport refused seq={} on {}: {}",
                    irp.sequence_number(),
                    self.endpoint.address,
                    error
                );
                self.send(PipeCommand::Rejected {
                    dispatched: Dispatched {
                        irp,
                        composite_child,
                    },
                    buffer,
                    error,
                });
            }
        }
    }
}

/// An endpoint-bound channel accepting IRPs
///
/// Share it behind an `Arc` to submit from several threads. Dropping the pipe
/// stops its completion worker; submissions still active at that point
/// complete with [`UsbError::Cancelled`](protocol::UsbError::Cancelled).
pub struct Pipe {
    shared: Arc<PipeShared>,
    worker: Option<JoinHandle<()>>,
}

impl Pipe {
    /// Create a closed pipe and start its completion worker
    pub fn new(
        endpoint: Endpoint,
        scope: ScopeId,
        scopes: Arc<dyn Scope>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let (commands, receiver) = async_channel::unbounded();
        let shared = Arc::new(PipeShared {
            endpoint,
            scope,
            scopes,
            transport,
            sink: Arc::new(PipeSink::new(commands.clone())),
            commands,
            open_lock: Mutex::new(()),
            open: AtomicBool::new(false),
            state: Mutex::new(SubmissionState::default()),
            idle: Condvar::new(),
            abort_lock: Mutex::new(()),
            listeners: ListenerSet::default(),
            sequence: AtomicU64::new(0),
            worker_thread: OnceLock::new(),
        });

        let worker = CompletionWorker::new(shared.clone(), receiver);
        let handle = thread::Builder::new()
            .name(format!("pipe-{}", endpoint.address))
            .spawn(move || worker.run())
            .map_err(|e| PipeError::WorkerSpawn(format!("completion worker: {}", e)))?;

        debug!("Created pipe for endpoint {}", endpoint.address);
        Ok(Self {
            shared,
            worker: Some(handle),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint
    }

    pub fn scope(&self) -> ScopeId {
        self.shared.scope
    }

    /// Whether the owning scope is active
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Open and usable; false whenever the scope is inactive
    pub fn is_open(&self) -> bool {
        self.is_active() && self.shared.open.load(Ordering::SeqCst)
    }

    /// Open the pipe (no-op if already open)
    pub fn open(&self) -> Result<()> {
        let _guard = lock(&self.shared.open_lock);
        if !self.is_active() {
            return Err(PipeError::NotActive);
        }
        if !self.shared.open.swap(true, Ordering::SeqCst) {
            info!("Opened pipe {}", self.shared.endpoint.address);
        }
        Ok(())
    }

    /// Close the pipe (no-op if already closed)
    ///
    /// Fails while any submission is still active.
    pub fn close(&self) -> Result<()> {
        let _guard = lock(&self.shared.open_lock);
        if !self.shared.open.load(Ordering::SeqCst) {
            return Ok(());
        }
        let state = lock(&self.shared.state);
        if state.active_units > 0 {
            return Err(PipeError::SubmissionsPending {
                active: state.active_units,
            });
        }
        self.shared.open.store(false, Ordering::SeqCst);
        info!("Closed pipe {}", self.shared.endpoint.address);
        Ok(())
    }

    /// Number of submitted units not yet terminally complete
    pub fn active_submissions(&self) -> usize {
        lock(&self.shared.state).active_units
    }

    /// Submit an IRP and return immediately
    pub fn async_submit(&self, irp: &Irp) -> Result<()> {
        let mut state = lock(&self.shared.state);
        self.shared.check_accepting(&state)?;
        self.shared.arm_irp(irp)?;
        state.active_units += 1;
        self.shared.enqueue(&mut state, Unit::Irp(irp.clone()));
        Ok(())
    }

    /// Submit an IRP and block until it completes
    ///
    /// Returns the transferred length, or the transfer error.
    pub fn sync_submit(&self, irp: &Irp) -> Result<usize> {
        self.shared.ensure_off_worker()?;
        let observed = irp.completion_count();
        self.async_submit(irp)?;
        irp.wait_for_completion(observed).into_result()
    }

    /// Submit a buffer in a fresh short-packet-accepting IRP
    pub fn async_submit_buffer(&self, data: Vec<u8>) -> Result<Irp> {
        let irp = Irp::new(data);
        self.async_submit(&irp)?;
        Ok(irp)
    }

    /// Transfer `data` and block; IN data is copied back into `data`
    pub fn sync_submit_buffer(&self, data: &mut [u8]) -> Result<usize> {
        let irp = Irp::new(data.to_vec());
        let result = self.sync_submit(&irp);
        let returned = irp.data();
        if returned.len() == data.len() {
            data.copy_from_slice(&returned);
        }
        result
    }

    /// Submit IRPs in list order with no other work interleaved
    ///
    /// Either every IRP is accepted or none is.
    pub fn async_submit_list(&self, irps: &[Irp]) -> Result<()> {
        let mut state = lock(&self.shared.state);
        self.shared.check_accepting(&state)?;

        for (index, irp) in irps.iter().enumerate() {
            if let Err(e) = self.shared.arm_irp(irp) {
                for armed in &irps[..index] {
                    armed.disarm();
                }
                return Err(e);
            }
        }

        state.active_units += irps.len();
        for irp in irps {
            self.shared.enqueue(&mut state, Unit::Irp(irp.clone()));
        }
        Ok(())
    }

    /// Submit IRPs in list order and block until all complete
    ///
    /// Returns the first failure in list order.
    pub fn sync_submit_list(&self, irps: &[Irp]) -> Result<()> {
        self.shared.ensure_off_worker()?;
        let observed: Vec<u64> = irps.iter().map(Irp::completion_count).collect();
        self.async_submit_list(irps)?;

        let mut first_error = None;
        for (irp, observed) in irps.iter().zip(observed) {
            if let Err(e) = irp.wait_for_completion(observed).into_result() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Submit a composite and return immediately
    pub fn async_submit_composite(&self, composite: &CompositeIrp) -> Result<()> {
        let mut state = lock(&self.shared.state);
        self.shared.check_accepting(&state)?;

        let children = composite.arm(|| self.shared.next_sequence())?;
        if let Err(e) = children.iter().try_for_each(|child| self.shared.validate_armed(child)) {
            composite.disarm();
            return Err(e);
        }

        state.active_units += 1;
        self.shared
            .enqueue(&mut state, Unit::Composite(composite.clone()));
        Ok(())
    }

    /// Submit a composite and block until it completes
    ///
    /// Returns the total transferred length, or the composite's error.
    pub fn sync_submit_composite(&self, composite: &CompositeIrp) -> Result<usize> {
        self.shared.ensure_off_worker()?;
        let observed = composite.completion_count();
        self.async_submit_composite(composite)?;
        composite.wait_for_completion(observed).into_result()
    }

    /// Cancel every active submission and wait until none remain
    ///
    /// Submissions arriving meanwhile fail with [`PipeError::PipeClosed`].
    /// IRPs that completed before the abort keep their results.
    pub fn abort_all_submissions(&self) -> Result<()> {
        self.shared.ensure_off_worker()?;
        let _abort = lock(&self.shared.abort_lock);

        let mut state = lock(&self.shared.state);
        state.aborting = true;
        let queued: Vec<Unit> = state.pending.drain(..).collect();
        let inflight: Vec<TransferHandle> = state.inflight.keys().copied().collect();
        info!(
            "Aborting pipe {}: {} queued, {} in flight",
            self.shared.endpoint.address,
            queued.len(),
            inflight.len()
        );

        for unit in queued {
            self.shared.send(PipeCommand::Cancel(unit));
        }
        for handle in inflight {
            self.shared.transport.cancel(handle);
        }

        let mut state = wait_while(&self.shared.idle, state, |s| s.active_units > 0);
        state.aborting = false;
        debug!("Abort on pipe {} finished", self.shared.endpoint.address);
        Ok(())
    }

    /// Register a listener; events reach listeners in registration order
    pub fn add_listener(&self, listener: impl PipeListener + 'static) -> ListenerId {
        self.shared.listeners.add(Arc::new(listener))
    }

    /// Register an already shared listener
    pub fn add_shared_listener(&self, listener: Arc<dyn PipeListener>) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    /// Returns whether the listener was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("endpoint", &self.shared.endpoint)
            .field("scope", &self.shared.scope)
            .field("open", &self.shared.open.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // The worker cancels whatever is still active before it exits
        self.shared.send(PipeCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            // Last handle released from a listener: the worker exits on its own
            if self.shared.on_worker_thread() {
                return;
            }
            if handle.join().is_err() {
                error!(
                    "Completion worker for pipe {} panicked",
                    self.shared.endpoint.address
                );
            }
        }
    }
}
