//! USB IRP submission, completion and resubmission engine
//!
//! Clients build [`Irp`]s (or [`ControlIrp`]s, or [`CompositeIrp`]s of
//! several), submit them to a [`Pipe`] and either block until completion or
//! return immediately and wait later. The pipe hands each transfer to an
//! abstract [`Transport`]; completions are processed on a dedicated worker
//! thread per pipe, which finalizes results, fires events to
//! [`PipeListener`]s and applies the resubmission [`policy`] hooks.
//!
//! # Example
//!
//! ```
//! use engine::{Irp, Pipe, ScopeRegistry, build_transport, TransportSettings};
//! use protocol::{Endpoint, EndpointAddress, EndpointType, ScopeId};
//! use std::sync::Arc;
//!
//! let scopes = Arc::new(ScopeRegistry::new());
//! scopes.activate(ScopeId(1));
//! let transport = build_transport(&TransportSettings::default()).unwrap();
//!
//! let out = Endpoint::new(EndpointAddress::new(0x01).unwrap(), EndpointType::Bulk, 512);
//! let inp = Endpoint::new(EndpointAddress::new(0x81).unwrap(), EndpointType::Bulk, 512);
//! let out_pipe = Pipe::new(out, ScopeId(1), scopes.clone(), transport.clone()).unwrap();
//! let in_pipe = Pipe::new(inp, ScopeId(1), scopes, transport).unwrap();
//! out_pipe.open().unwrap();
//! in_pipe.open().unwrap();
//!
//! assert_eq!(out_pipe.sync_submit(&Irp::new(b"ping".to_vec())).unwrap(), 4);
//!
//! let mut reply = [0u8; 16];
//! let n = in_pipe.sync_submit_buffer(&mut reply).unwrap();
//! assert_eq!(&reply[..n], b"ping");
//! ```

pub mod composite;
pub mod control;
pub mod error;
pub mod events;
pub mod irp;
pub mod loopback;
pub mod pipe;
pub mod policy;
mod sync;
pub mod test_utils;
pub mod transport;
mod worker;

pub use composite::CompositeIrp;
pub use control::{ControlIrp, ControlRequest};
pub use error::{ErrorKind, PipeError, Result};
pub use events::{ForwardListener, ListenerId, PipeListener};
pub use irp::{Irp, UsbIrp};
pub use loopback::{BackendKind, LoopbackTransport, TransportSettings, build_transport};
pub use pipe::Pipe;
pub use transport::{
    BeginError, CompletionSink, Scope, ScopeRegistry, TransferCompletion, TransferHandle,
    TransferRequest, Transport,
};
