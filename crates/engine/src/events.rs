//! Pipe listeners and event dispatch
//!
//! Listeners run synchronously on the pipe's completion worker, in
//! registration order. A listener that blocks stalls completion processing for
//! that pipe (and therefore resubmission and composite continuation) until it
//! returns; use [`ForwardListener`] to hand events to an async consumer.

use crate::sync::lock;
use common::EventForwarder;
use protocol::{DataEvent, ErrorEvent, PipeEvent};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Receives completion events from a pipe
///
/// Implement `data_event`/`error_event`, or override `on_event` to handle
/// both in one place. Closures taking `&PipeEvent` are listeners too.
pub trait PipeListener: Send + Sync {
    fn on_event(&self, event: &PipeEvent) {
        match event {
            PipeEvent::Data(event) => self.data_event(event),
            PipeEvent::Error(event) => self.error_event(event),
        }
    }

    fn data_event(&self, _event: &DataEvent) {}

    fn error_event(&self, _event: &ErrorEvent) {}
}

impl<F> PipeListener for F
where
    F: Fn(&PipeEvent) + Send + Sync,
{
    fn on_event(&self, event: &PipeEvent) {
        self(event)
    }
}

/// Forwards every event into a [`common::EventStream`]
///
/// The bridge is bounded; a full channel blocks the completion worker.
pub struct ForwardListener {
    forwarder: EventForwarder,
}

impl ForwardListener {
    pub fn new(forwarder: EventForwarder) -> Self {
        Self { forwarder }
    }
}

impl PipeListener for ForwardListener {
    fn on_event(&self, event: &PipeEvent) {
        if let Err(e) = self.forwarder.send_event(event.clone()) {
            debug!("Dropping event seq={}: {}", event.sequence_number(), e);
        }
    }
}

/// Registration handle returned by [`crate::Pipe::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered listener registry of one pipe
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn PipeListener>)>>,
}

impl ListenerSet {
    pub fn add(&self, listener: Arc<dyn PipeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.listeners).is_empty()
    }

    /// Deliver `event` to every listener in registration order
    ///
    /// The registry lock is not held while listeners run, so a listener may
    /// add or remove listeners; the change applies to the next event.
    pub fn dispatch(&self, event: &PipeEvent) {
        let snapshot: Vec<_> = lock(&self.listeners)
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();

        for (id, listener) in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if let Err(e) = result {
                error!("Panic in pipe listener {:?}: {:?}", id, e);
            }
        }
    }
}

/// Run a policy, falling back to `default` if it panics
pub(crate) fn guarded<T>(what: &str, default: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(e) => {
            warn!("Panic in {}: {:?}", what, e);
            default
        }
    }
}
