//! Library half of the `irp-loopback` tool
//!
//! Configuration loading and the submission scenario live here so they can
//! be tested without starting the binary.

pub mod config;
pub mod scenario;

pub use config::LoopbackConfig;
pub use scenario::{LoopbackPipes, ScenarioReport};
