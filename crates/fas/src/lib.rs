//! `FlaggedArraySet`: a bounded, ordered, content-addressed set of byte
//! payloads, shared by every compressor variant to give transactions and
//! block-relative indices a common numbering.
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod dedupable;
mod error;
mod set;
mod wait_mutex;

pub use dedupable::Dedupable;
pub use error::FasError;
pub use set::FlaggedArraySet;
pub use wait_mutex::WaitCountMutex;
