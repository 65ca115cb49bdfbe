//! Per-protocol-version block and transaction (de)compression, using a
//! [`relay_fas::FlaggedArraySet`] as each version's shared dictionary with
//! its peers.
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod block;
mod compressor;
mod error;
mod set;
mod varint;
mod version;

pub use block::{parse_raw_block, DecompressState, HEADER_LEN};
pub use compressor::{Compressor, TxReplay, DEFAULT_KNOWN_TX_CAPACITY};
pub use error::CompressError;
pub use set::CompressorSet;
pub use version::{
    lookup_version, CompressorConfig, VersionInfo, COMPRESSOR_CONFIGS, KNOWN_VERSIONS,
    PREFERRED_VERSION_TAG,
};
