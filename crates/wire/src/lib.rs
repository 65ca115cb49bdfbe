//! Frame-level protocol for the downstream relay connection: message types,
//! their `tokio_util` codec, and the double-SHA256 identity hash used
//! throughout the relay to name payloads and blocks.
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod codec;
mod error;
mod hash;
mod message;

pub use codec::RelayCodec;
pub use error::WireError;
pub use hash::{double_sha256, merkle_root, Hash256};
pub use message::{MessageType, RelayMessage, MAGIC_BYTES, MAX_FRAME_LEN};
