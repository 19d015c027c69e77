//! Async channel bridge between the completion worker and async consumers
//!
//! Pipe listeners run synchronously on a pipe's completion worker thread.
//! [`EventForwarder`] is the blocking half used from that thread;
//! [`EventStream`] is the async half consumed from the Tokio runtime.
//!
//! The channel is bounded. When the consumer falls behind, `send_event`
//! blocks the completion worker, which in turn stalls completion processing
//! for the pipe that owns the listener.

use async_channel::{Receiver, Sender, bounded};
use protocol::PipeEvent;
use tracing::trace;

/// Default capacity of the event bridge
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Blocking sender half, owned by the completion path
#[derive(Clone)]
pub struct EventForwarder {
    event_tx: Sender<PipeEvent>,
}

impl EventForwarder {
    /// Send an event, blocking while the channel is full
    pub fn send_event(&self, event: PipeEvent) -> crate::Result<()> {
        trace!("Forwarding event seq={}", event.sequence_number());
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::EventChannelClosed(e.to_string()))
    }

    /// Whether the receiving side has been dropped
    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Async receiver half
#[derive(Clone)]
pub struct EventStream {
    event_rx: Receiver<PipeEvent>,
}

impl EventStream {
    /// Receive the next event
    pub async fn recv_event(&self) -> crate::Result<PipeEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::EventChannelClosed(e.to_string()))
    }

    /// Receive from a blocking context
    pub fn recv_event_blocking(&self) -> crate::Result<PipeEvent> {
        self.event_rx
            .recv_blocking()
            .map_err(|e| crate::Error::EventChannelClosed(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv_event(&self) -> Option<PipeEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Number of events waiting to be consumed
    pub fn pending(&self) -> usize {
        self.event_rx.len()
    }
}

/// Create the event bridge
///
/// Returns (EventForwarder for the completion path, EventStream for async consumers)
pub fn create_event_bridge(capacity: usize) -> (EventForwarder, EventStream) {
    let (event_tx, event_rx) = bounded(capacity.max(1));

    (EventForwarder { event_tx }, EventStream { event_rx })
}
