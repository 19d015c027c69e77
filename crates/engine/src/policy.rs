//! Pluggable decision points invoked on the completion path
//!
//! Every policy is a small trait with a blanket implementation for closures,
//! so callers can pass either a named type or `|irp: &dyn UsbIrp| ...`.
//! Policies run on the pipe's completion worker with no engine locks held;
//! they may inspect the IRP freely but must not block on the same pipe.

use crate::composite::CompositeIrp;
use crate::irp::{Irp, UsbIrp};

/// Decides the buffer for an automatic resubmission after a successful transfer
///
/// `Some(buffer)` replaces the current buffer, `None` keeps it.
pub trait ResubmitDataPolicy: Send + Sync {
    fn resubmit_data(&self, irp: &dyn UsbIrp) -> Option<Vec<u8>>;
}

/// Decides whether to resubmit after a failed transfer
///
/// Returning `false` disables resubmission and the error becomes terminal.
pub trait ResubmitErrorPolicy: Send + Sync {
    fn resubmit_on_error(&self, irp: &dyn UsbIrp) -> bool;
}

/// Decides whether a completion fires a pipe event
pub trait EventPolicy: Send + Sync {
    fn fire_event(&self, irp: &dyn UsbIrp) -> bool;
}

/// Decides whether a composite continues after one of its children failed
pub trait CompositeErrorCommand: Send + Sync {
    fn continue_submissions(&self, composite: &CompositeIrp, failed: &Irp) -> bool;
}

impl<F> ResubmitDataPolicy for F
where
    F: Fn(&dyn UsbIrp) -> Option<Vec<u8>> + Send + Sync,
{
    fn resubmit_data(&self, irp: &dyn UsbIrp) -> Option<Vec<u8>> {
        self(irp)
    }
}

impl<F> ResubmitErrorPolicy for F
where
    F: Fn(&dyn UsbIrp) -> bool + Send + Sync,
{
    fn resubmit_on_error(&self, irp: &dyn UsbIrp) -> bool {
        self(irp)
    }
}

impl<F> EventPolicy for F
where
    F: Fn(&dyn UsbIrp) -> bool + Send + Sync,
{
    fn fire_event(&self, irp: &dyn UsbIrp) -> bool {
        self(irp)
    }
}

impl<F> CompositeErrorCommand for F
where
    F: Fn(&CompositeIrp, &Irp) -> bool + Send + Sync,
{
    fn continue_submissions(&self, composite: &CompositeIrp, failed: &Irp) -> bool {
        self(composite, failed)
    }
}

/// Resubmit with a deep copy of the previous buffer
///
/// Default data policy for a plain IRP; the copy keeps the next transfer from
/// aliasing data a listener may still hold.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyBuffer;

impl ResubmitDataPolicy for CopyBuffer {
    fn resubmit_data(&self, irp: &dyn UsbIrp) -> Option<Vec<u8>> {
        Some(irp.data())
    }
}

/// Resubmit with the existing buffer(s)
///
/// Default data policy for a composite.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepBuffer;

impl ResubmitDataPolicy for KeepBuffer {
    fn resubmit_data(&self, _irp: &dyn UsbIrp) -> Option<Vec<u8>> {
        None
    }
}

/// Never resubmit after an error
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOnError;

impl ResubmitErrorPolicy for StopOnError {
    fn resubmit_on_error(&self, _irp: &dyn UsbIrp) -> bool {
        false
    }
}

/// Always fire an event (plain IRP default)
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFire;

impl EventPolicy for AlwaysFire {
    fn fire_event(&self, _irp: &dyn UsbIrp) -> bool {
        true
    }
}

/// Never fire an event (composite default)
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFire;

impl EventPolicy for NeverFire {
    fn fire_event(&self, _irp: &dyn UsbIrp) -> bool {
        false
    }
}

/// Stop the composite at the first failing child (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct StopSubmissions;

impl CompositeErrorCommand for StopSubmissions {
    fn continue_submissions(&self, _composite: &CompositeIrp, _failed: &Irp) -> bool {
        false
    }
}

/// Keep submitting the remaining children regardless of failures
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueSubmissions;

impl CompositeErrorCommand for ContinueSubmissions {
    fn continue_submissions(&self, _composite: &CompositeIrp, _failed: &Irp) -> bool {
        true
    }
}
