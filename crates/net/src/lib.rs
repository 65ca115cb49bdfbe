//! The per-peer connection state machine and the registry of connected
//! downstream peers.
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod connection;
mod error;
mod peer;
mod registry;

pub use connection::{run_connection, OrchestratorHandle, ProvideBlockResult};
pub use error::ConnectionError;
pub use peer::{ConnectionPhase, PeerHandle, SendToken};
pub use registry::{AdmitOutcome, PeerRegistry};
