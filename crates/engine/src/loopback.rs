//! Loopback transport backend
//!
//! A software device running on its own thread. Bytes written to an OUT
//! endpoint are queued per endpoint number and returned by reads of the IN
//! endpoint with the same number. A read with nothing queued waits, like a
//! device NAKing, until data arrives or the read is cancelled; a read larger
//! than the queued data completes short.
//!
//! Optional fault injection: a fixed latency per transfer, a random I/O
//! failure rate, and stalled endpoints that always report `Halted`.

use crate::error::{PipeError, Result};
use crate::sync::lock;
use crate::transport::{
    BeginError, CompletionSink, TransferCompletion, TransferHandle, TransferRequest, Transport,
};
use async_channel::{Receiver, Sender};
use protocol::{Direction, UsbError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Which software device backs the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OUT data is echoed back on IN reads
    #[default]
    Loopback,
    /// OUT data is dropped, IN reads complete with zero bytes
    Discard,
}

/// Transport backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default)]
    pub backend: BackendKind,
    /// Delay applied before each transfer is processed
    #[serde(default)]
    pub latency_ms: u64,
    /// Probability in [0, 1] that a transfer fails with an I/O error
    #[serde(default)]
    pub fault_rate: f64,
    /// Endpoint addresses that report `Halted` on every transfer
    #[serde(default)]
    pub stalled_endpoints: Vec<u8>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            latency_ms: 0,
            fault_rate: 0.0,
            stalled_endpoints: Vec::new(),
        }
    }
}

impl TransportSettings {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

/// Build the transport selected by `settings`
pub fn build_transport(settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
    info!("Starting {:?} transport backend", settings.backend);
    Ok(Arc::new(LoopbackTransport::new(settings.clone())?))
}

enum LoopbackCommand {
    Transfer {
        handle: TransferHandle,
        request: TransferRequest,
        sink: Arc<dyn CompletionSink>,
    },
    Cancel(TransferHandle),
    Shutdown,
}

/// In-process transport backed by a software device thread
pub struct LoopbackTransport {
    commands: Sender<LoopbackCommand>,
    next_handle: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackTransport {
    pub fn new(settings: TransportSettings) -> Result<Self> {
        let (commands, receiver) = async_channel::unbounded();
        let device = LoopbackDevice::new(settings);
        let thread = thread::Builder::new()
            .name("loopback-transport".to_string())
            .spawn(move || device.run(receiver))
            .map_err(|e| PipeError::WorkerSpawn(format!("loopback transport: {}", e)))?;

        Ok(Self {
            commands,
            next_handle: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl Transport for LoopbackTransport {
    fn begin_transfer(
        &self,
        request: TransferRequest,
        sink: Arc<dyn CompletionSink>,
    ) -> std::result::Result<TransferHandle, BeginError> {
        let in_bounds = request
            .offset
            .checked_add(request.length)
            .is_some_and(|end| end <= request.buffer.len());
        if !in_bounds {
            return Err(BeginError {
                error: UsbError::Io,
                buffer: request.buffer,
            });
        }

        let handle = TransferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let command = LoopbackCommand::Transfer {
            handle,
            request,
            sink,
        };
        match self.commands.try_send(command) {
            Ok(()) => Ok(handle),
            Err(e) => {
                let buffer = match e.into_inner() {
                    LoopbackCommand::Transfer { request, .. } => request.buffer,
                    _ => Vec::new(),
                };
                Err(BeginError {
                    error: UsbError::Io,
                    buffer,
                })
            }
        }
    }

    fn cancel(&self, handle: TransferHandle) {
        if self.commands.try_send(LoopbackCommand::Cancel(handle)).is_err() {
            debug!("Loopback device gone, cannot cancel {:?}", handle);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let _ = self.commands.try_send(LoopbackCommand::Shutdown);
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                error!("Loopback transport thread panicked");
            }
        }
    }
}

struct ParkedRead {
    handle: TransferHandle,
    request: TransferRequest,
    sink: Arc<dyn CompletionSink>,
}

struct LoopbackDevice {
    settings: TransportSettings,
    /// Queued OUT bytes by endpoint number
    fifos: HashMap<u8, VecDeque<u8>>,
    parked: VecDeque<ParkedRead>,
}

impl LoopbackDevice {
    fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            fifos: HashMap::new(),
            parked: VecDeque::new(),
        }
    }

    fn run(mut self, commands: Receiver<LoopbackCommand>) {
        info!("Loopback transport thread started");

        while let Ok(command) = commands.recv_blocking() {
            match command {
                LoopbackCommand::Shutdown => break,
                LoopbackCommand::Cancel(handle) => self.cancel(handle),
                LoopbackCommand::Transfer {
                    handle,
                    request,
                    sink,
                } => {
                    if self.settings.latency_ms > 0 {
                        thread::sleep(self.settings.latency());
                    }
                    self.process(handle, request, sink);
                }
            }
        }

        for read in self.parked.drain(..) {
            complete(&read.sink, read.handle, read.request.buffer, 0, Some(UsbError::Cancelled));
        }
        info!("Loopback transport thread stopped");
    }

    fn process(&mut self, handle: TransferHandle, mut request: TransferRequest, sink: Arc<dyn CompletionSink>) {
        let address = request.endpoint.as_u8();
        if self.settings.stalled_endpoints.contains(&address) {
            debug!("Endpoint {} stalled, failing {:?}", request.endpoint, handle);
            return complete(&sink, handle, request.buffer, 0, Some(UsbError::Halted));
        }
        if self.settings.fault_rate > 0.0
            && rand::rng().random_bool(self.settings.fault_rate.min(1.0))
        {
            debug!("Injecting I/O fault on {:?}", handle);
            return complete(&sink, handle, request.buffer, 0, Some(UsbError::Io));
        }

        let length = request.length;
        match (self.settings.backend, request.direction) {
            (BackendKind::Discard, Direction::Out) => {
                complete(&sink, handle, request.buffer, length, None);
            }
            (BackendKind::Discard, Direction::In) => {
                complete(&sink, handle, request.buffer, 0, None);
            }
            (BackendKind::Loopback, Direction::Out) => {
                let number = request.endpoint.number();
                self.fifos
                    .entry(number)
                    .or_default()
                    .extend(request.data().iter().copied());
                trace!("Queued {} bytes on endpoint number {}", length, number);
                complete(&sink, handle, request.buffer, length, None);
                self.serve_parked(number);
            }
            (BackendKind::Loopback, Direction::In) => {
                let number = request.endpoint.number();
                let queued = self.fifos.get(&number).map_or(0, VecDeque::len);
                // Control reads never wait; they return whatever is queued
                if queued == 0 && length > 0 && request.setup.is_none() {
                    trace!("Parking read {:?} on endpoint number {}", handle, number);
                    self.parked.push_back(ParkedRead {
                        handle,
                        request,
                        sink,
                    });
                    return;
                }
                let actual = self.read_into(number, &mut request);
                complete(&sink, handle, request.buffer, actual, None);
            }
        }
    }

    fn read_into(&mut self, number: u8, request: &mut TransferRequest) -> usize {
        let Some(fifo) = self.fifos.get_mut(&number) else {
            return 0;
        };
        let count = request.length.min(fifo.len());
        for (slot, byte) in request.data_mut()[..count].iter_mut().zip(fifo.drain(..count)) {
            *slot = byte;
        }
        count
    }

    /// Complete parked reads on `number` while data is queued
    fn serve_parked(&mut self, number: u8) {
        while self.fifos.get(&number).is_some_and(|fifo| !fifo.is_empty()) {
            let Some(position) = self
                .parked
                .iter()
                .position(|read| read.request.endpoint.number() == number)
            else {
                return;
            };
            let Some(mut read) = self.parked.remove(position) else {
                return;
            };
            let actual = self.read_into(number, &mut read.request);
            complete(&read.sink, read.handle, read.request.buffer, actual, None);
        }
    }

    fn cancel(&mut self, handle: TransferHandle) {
        match self.parked.iter().position(|read| read.handle == handle) {
            Some(position) => {
                if let Some(read) = self.parked.remove(position) {
                    debug!("Cancelled parked read {:?}", handle);
                    complete(&read.sink, read.handle, read.request.buffer, 0, Some(UsbError::Cancelled));
                }
            }
            None => trace!("Cancel for {:?} arrived after completion", handle),
        }
    }
}

fn complete(
    sink: &Arc<dyn CompletionSink>,
    handle: TransferHandle,
    buffer: Vec<u8>,
    actual_length: usize,
    error: Option<UsbError>,
) {
    sink.on_transfer_complete(TransferCompletion {
        handle,
        buffer,
        actual_length,
        error,
    });
}
