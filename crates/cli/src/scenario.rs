//! Submission scenario run against the configured transport
//!
//! Exercises the pipe API end to end: synchronous echo round trips, an IRP
//! list, a composite, a control request pair on the default pipe and a
//! self-resubmitting reader. Transfer failures are counted, not fatal, so a
//! faulty backend still produces a report.

use crate::config::{PipeSettings, ScenarioSettings};
use anyhow::{Context, Result};
use engine::{
    CompositeIrp, ControlIrp, Irp, Pipe, PipeListener, ScopeRegistry, Transport, UsbIrp,
};
use protocol::{Endpoint, EndpointAddress, PipeEvent, ScopeId, UsbError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scope owning every pipe the tool opens
pub const LOOPBACK_SCOPE: ScopeId = ScopeId(1);

/// Vendor request used for the control round trip
const VENDOR_ECHO_REQUEST: u8 = 0x01;
const CONTROL_PAYLOAD_LEN: usize = 8;

/// Default control pipe plus the configured OUT/IN pair
pub struct LoopbackPipes {
    pub control: Pipe,
    pub out: Pipe,
    pub input: Pipe,
}

impl LoopbackPipes {
    /// Activate [`LOOPBACK_SCOPE`] and open all three pipes
    pub fn open(
        settings: &PipeSettings,
        scopes: Arc<ScopeRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        scopes.activate(LOOPBACK_SCOPE);

        let endpoint = |address: u8| -> Result<Endpoint> {
            let address = EndpointAddress::new(address)
                .with_context(|| format!("Invalid endpoint address 0x{:02x}", address))?;
            Ok(Endpoint::new(
                address,
                settings.transfer_type,
                settings.max_packet_size,
            ))
        };

        let open = |endpoint: Endpoint| -> Result<Pipe> {
            let pipe = Pipe::new(endpoint, LOOPBACK_SCOPE, scopes.clone(), transport.clone())
                .with_context(|| format!("Failed to create pipe {}", endpoint.address))?;
            pipe.open()
                .with_context(|| format!("Failed to open pipe {}", endpoint.address))?;
            Ok(pipe)
        };

        Ok(Self {
            control: open(Endpoint::default_control())?,
            out: open(endpoint(settings.out_endpoint)?)?,
            input: open(endpoint(settings.in_endpoint)?)?,
        })
    }

    fn all(&self) -> [&Pipe; 3] {
        [&self.control, &self.out, &self.input]
    }

    /// Register a listener on every pipe
    pub fn add_shared_listener(&self, listener: Arc<dyn PipeListener>) {
        for pipe in self.all() {
            pipe.add_shared_listener(listener.clone());
        }
    }

    /// Abort outstanding work on every pipe
    pub fn abort_all(&self) -> Result<()> {
        for pipe in self.all() {
            pipe.abort_all_submissions()
                .with_context(|| format!("Failed to abort pipe {}", pipe.endpoint().address))?;
        }
        Ok(())
    }

    /// Close every pipe
    pub fn close_all(&self) -> Result<()> {
        for pipe in self.all() {
            pipe.close()
                .with_context(|| format!("Failed to close pipe {}", pipe.endpoint().address))?;
        }
        Ok(())
    }
}

/// Counters collected while the scenario runs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    /// Round trips whose read matched the write
    pub echoed: usize,
    /// Round trips that read back different bytes
    pub mismatched: usize,
    /// Transfers that failed or timed out
    pub failed: usize,
    pub list_bytes: usize,
    pub composite_bytes: usize,
    pub control_bytes: usize,
    /// Completions delivered by the resubmitting reader
    pub resubmissions: usize,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scenario summary:")?;
        writeln!(f, "  echo round trips:  {} ok, {} mismatched", self.echoed, self.mismatched)?;
        writeln!(f, "  failed transfers:  {}", self.failed)?;
        writeln!(f, "  list bytes read:   {}", self.list_bytes)?;
        writeln!(f, "  composite bytes:   {}", self.composite_bytes)?;
        writeln!(f, "  control bytes:     {}", self.control_bytes)?;
        write!(f, "  resubmissions:     {}", self.resubmissions)
    }
}

type Round = fn(&ScenarioSettings, &LoopbackPipes, &mut ScenarioReport) -> Result<()>;

/// Deterministic payload for round `round`
pub fn pattern(round: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| (round + i) as u8).collect()
}

/// Run every round, checking `stop` between them
///
/// Blocks the calling thread; run it off the async runtime.
pub fn run(
    settings: &ScenarioSettings,
    pipes: &LoopbackPipes,
    stop: &AtomicBool,
) -> Result<ScenarioReport> {
    let mut report = ScenarioReport::default();
    let rounds: [(&str, Round); 5] = [
        ("echo", echo_round),
        ("list", list_round),
        ("composite", composite_round),
        ("control", control_round),
        ("resubmit", resubmit_round),
    ];

    for (name, round) in rounds {
        if stop.load(Ordering::SeqCst) {
            info!("Stopping before {} round", name);
            break;
        }
        info!("Running {} round", name);
        round(settings, pipes, &mut report).with_context(|| format!("{} round failed", name))?;
    }

    Ok(report)
}

fn read_timeout(settings: &ScenarioSettings) -> Duration {
    Duration::from_millis(settings.read_timeout_ms)
}

/// Wait for a read; abort the IN pipe if it does not complete in time
fn await_read(pipe: &Pipe, irp: &Irp, timeout: Duration) -> Result<Option<Vec<u8>>> {
    if !irp.wait_until_complete(Some(timeout)) {
        warn!("Read seq={} timed out, aborting", irp.sequence_number());
        pipe.abort_all_submissions()?;
        return Ok(None);
    }
    match irp.error() {
        Some(error) => {
            warn!("Read seq={} failed: {}", irp.sequence_number(), error);
            Ok(None)
        }
        None => Ok(Some(irp.transferred_data())),
    }
}

fn echo_round(
    settings: &ScenarioSettings,
    pipes: &LoopbackPipes,
    report: &mut ScenarioReport,
) -> Result<()> {
    for round in 0..settings.transfers {
        let payload = pattern(round, settings.buffer_size);
        let written = match pipes.out.sync_submit(&Irp::new(payload.clone())) {
            Ok(written) => written,
            Err(e) => {
                warn!("Write {} failed: {}", round, e);
                report.failed += 1;
                continue;
            }
        };

        let read = Irp::new(vec![0; settings.buffer_size]);
        pipes.input.async_submit(&read)?;
        match await_read(&pipes.input, &read, read_timeout(settings))? {
            Some(data) if data == payload[..written] => report.echoed += 1,
            Some(data) => {
                debug!("Round {} read {} bytes, wrote {}", round, data.len(), written);
                report.mismatched += 1;
            }
            None => report.failed += 1,
        }
    }
    Ok(())
}

fn list_round(
    settings: &ScenarioSettings,
    pipes: &LoopbackPipes,
    report: &mut ScenarioReport,
) -> Result<()> {
    if settings.transfers == 0 {
        return Ok(());
    }

    let writes: Vec<Irp> = (0..settings.transfers)
        .map(|round| Irp::new(pattern(round, settings.buffer_size)))
        .collect();
    if let Err(e) = pipes.out.sync_submit_list(&writes) {
        warn!("IRP list write failed: {}", e);
    }
    let failed_writes = writes.iter().filter(|irp| irp.is_error()).count();
    report.failed += failed_writes;

    let reads: Vec<Irp> = (0..writes.len() - failed_writes)
        .map(|_| Irp::new(vec![0; settings.buffer_size]))
        .collect();
    pipes.input.async_submit_list(&reads)?;
    for read in &reads {
        match await_read(&pipes.input, read, read_timeout(settings))? {
            Some(data) => report.list_bytes += data.len(),
            None => report.failed += 1,
        }
    }
    Ok(())
}

fn composite_round(
    settings: &ScenarioSettings,
    pipes: &LoopbackPipes,
    report: &mut ScenarioReport,
) -> Result<()> {
    let children = settings.composite_children;
    if children == 0 {
        return Ok(());
    }

    let write = CompositeIrp::new(
        (0..children)
            .map(|index| Irp::new(pattern(index, settings.buffer_size)))
            .collect(),
    );
    match pipes.out.sync_submit_composite(&write) {
        Ok(written) => debug!("Composite wrote {} bytes", written),
        Err(e) => {
            warn!("Composite write failed: {}", e);
            report.failed += 1;
            return Ok(());
        }
    }

    let read = CompositeIrp::new(
        (0..children)
            .map(|_| Irp::new(vec![0; settings.buffer_size]))
            .collect(),
    );
    read.set_event_policy(|irp: &dyn UsbIrp| irp.error().is_none());
    pipes.input.async_submit_composite(&read)?;

    let timeout = read_timeout(settings) * children as u32;
    if !read.wait_until_complete(Some(timeout)) {
        warn!("Composite read timed out, aborting");
        pipes.input.abort_all_submissions()?;
        report.failed += 1;
        return Ok(());
    }
    match read.error() {
        Some(error) => {
            warn!("Composite read failed: {}", error);
            report.failed += 1;
        }
        None => report.composite_bytes += read.data().len(),
    }
    Ok(())
}

fn control_round(
    _settings: &ScenarioSettings,
    pipes: &LoopbackPipes,
    report: &mut ScenarioReport,
) -> Result<()> {
    let payload = pattern(0xC0, CONTROL_PAYLOAD_LEN);
    let write = ControlIrp::with_fields(0x40, VENDOR_ECHO_REQUEST, 0, 0, payload);
    if let Err(e) = pipes.control.sync_submit(&write) {
        warn!("Control write failed: {}", e);
        report.failed += 1;
        return Ok(());
    }

    let read = ControlIrp::with_fields(
        0xC0,
        VENDOR_ECHO_REQUEST,
        0,
        0,
        vec![0; CONTROL_PAYLOAD_LEN],
    );
    match pipes.control.sync_submit(&read) {
        Ok(length) => report.control_bytes += length,
        Err(e) => {
            warn!("Control read failed: {}", e);
            report.failed += 1;
        }
    }
    Ok(())
}

fn resubmit_round(
    settings: &ScenarioSettings,
    pipes: &LoopbackPipes,
    report: &mut ScenarioReport,
) -> Result<()> {
    if settings.resubmit_count == 0 {
        return Ok(());
    }

    let (completed_tx, completed_rx) = mpsc::channel();
    let listener = pipes.input.add_listener(move |event: &PipeEvent| {
        if let PipeEvent::Data(event) = event {
            let _ = completed_tx.send(event.sequence_number);
        }
    });

    let reader = Irp::new(vec![0; settings.buffer_size]);
    reader.set_resubmit(true)?;
    // Injected faults are transient; anything else ends the loop
    reader.set_resubmit_error_policy(|irp: &dyn UsbIrp| irp.error() == Some(UsbError::Io));
    pipes.input.async_submit(&reader)?;

    for round in 0..settings.resubmit_count {
        if let Err(e) = pipes.out.sync_submit(&Irp::new(pattern(round, settings.buffer_size))) {
            warn!("Write {} for resubmitting reader failed: {}", round, e);
            report.failed += 1;
            continue;
        }
        match completed_rx.recv_timeout(read_timeout(settings)) {
            Ok(sequence_number) => {
                debug!("Resubmitting reader completed seq={}", sequence_number);
                report.resubmissions += 1;
            }
            Err(_) => {
                warn!("Resubmitting reader stopped completing");
                report.failed += 1;
                break;
            }
        }
    }

    pipes.input.abort_all_submissions()?;
    pipes.input.remove_listener(listener);
    Ok(())
}
