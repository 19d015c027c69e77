//! irp-loopback
//!
//! Wires a software transport backend to a pair of pipes and runs a
//! submission scenario against it, logging every pipe event.

use anyhow::{Context, Result};
use clap::Parser;
use cli::config::LoopbackConfig;
use cli::scenario::{self, LOOPBACK_SCOPE, LoopbackPipes};
use common::channel::DEFAULT_EVENT_CAPACITY;
use common::{EventStream, create_event_bridge, setup_logging};
use engine::{ForwardListener, ScopeRegistry, build_transport};
use protocol::PipeEvent;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "irp-loopback")]
#[command(
    author,
    version,
    about = "Drive USB IRP pipes against a loopback transport"
)]
#[command(long_about = "
Runs echo, list, composite, control and resubmission rounds through the IRP
engine using an in-process loopback device, then prints a summary.

EXAMPLES:
    # Run with default config
    irp-loopback

    # Run with custom config
    irp-loopback --config ~/loopback.toml

    # Inject faults into one transfer in five
    irp-loopback --fault-rate 0.2 --log-level debug

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-irp/loopback.toml
    3. /etc/usb-irp/loopback.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Number of echo round trips
    #[arg(long, value_name = "COUNT")]
    transfers: Option<usize>,

    /// Bytes per transfer
    #[arg(long, value_name = "BYTES")]
    buffer_size: Option<usize>,

    /// Probability of an injected I/O fault per transfer
    #[arg(long, value_name = "RATE")]
    fault_rate: Option<f64>,
}

impl Args {
    /// Command line values override the file
    fn apply(&self, config: &mut LoopbackConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(transfers) = self.transfers {
            config.scenario.transfers = transfers;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.scenario.buffer_size = buffer_size;
        }
        if let Some(fault_rate) = self.fault_rate {
            config.transport.fault_rate = fault_rate;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = LoopbackConfig::default();
        let path = LoopbackConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        LoopbackConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        LoopbackConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid command line options")?;

    setup_logging(&config.logging.level).context("Failed to setup logging")?;

    info!("irp-loopback v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.logging.level);

    let transport = build_transport(&config.transport).context("Failed to start transport")?;
    let scopes = Arc::new(ScopeRegistry::new());
    let pipes = Arc::new(
        LoopbackPipes::open(&config.pipe, scopes.clone(), transport)
            .context("Failed to open pipes")?,
    );

    let (forwarder, stream) = create_event_bridge(DEFAULT_EVENT_CAPACITY);
    pipes.add_shared_listener(Arc::new(ForwardListener::new(forwarder)));
    let event_logger = tokio::spawn(log_events(stream));

    let stop = Arc::new(AtomicBool::new(false));
    let mut scenario_task = tokio::task::spawn_blocking({
        let pipes = pipes.clone();
        let stop = stop.clone();
        let settings = config.scenario.clone();
        move || scenario::run(&settings, &pipes, &stop)
    });

    let joined = tokio::select! {
        joined = &mut scenario_task => joined,
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, aborting submissions..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            stop.store(true, Ordering::SeqCst);
            let aborting = pipes.clone();
            tokio::task::spawn_blocking(move || aborting.abort_all())
                .await
                .context("Abort task panicked")??;
            scenario_task.await
        }
    };
    let report = joined.context("Scenario task panicked")??;

    if let Err(e) = pipes.close_all() {
        warn!("{:#}", e);
    }
    scopes.deactivate(LOOPBACK_SCOPE);
    // Dropping the pipes stops their workers and closes the event bridge
    drop(pipes);

    match event_logger.await {
        Ok(count) => debug!("Event logger saw {} events", count),
        Err(e) => error!("Event logger task failed: {}", e),
    }

    println!("{}", report);
    info!("Shutdown complete");
    Ok(())
}

/// Log pipe events until every forwarder is gone
async fn log_events(stream: EventStream) -> usize {
    let mut count = 0;
    while let Ok(event) = stream.recv_event().await {
        count += 1;
        match event {
            PipeEvent::Data(event) => debug!(
                "Data on {} seq={} ({} bytes)",
                event.endpoint,
                event.sequence_number,
                event.data_length()
            ),
            PipeEvent::Error(event) => warn!(
                "Error on {} seq={}: {}",
                event.endpoint, event.sequence_number, event.error
            ),
        }
    }
    count
}
