//! Wires the trusted upstream source, the mempool hint channel, and the
//! downstream peer registry into one shared [`Orchestrator`].
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod error;
mod mempool;
mod orchestrator;
mod upstream;

pub use error::UpstreamError;
pub use mempool::{MempoolClient, MempoolHashStream};
pub use orchestrator::Orchestrator;
pub use upstream::{TcpUpstreamSource, UpstreamEvent, UpstreamEventReader, UpstreamSource};
