use bytes::{Buf, Bytes};
use relay_wire::{double_sha256, merkle_root, Hash256};

use crate::error::CompressError;
use crate::varint::read_varint;

/// Length of the block header this crate understands: version(4) ||
/// prev_hash(32) || merkle_root(32) || time(4) || bits(4) || nonce(4).
pub const HEADER_LEN: usize = 80;

const MERKLE_ROOT_RANGE: std::ops::Range<usize> = 36..68;

/// A block decomposed into its header and full transaction bodies, either
/// freshly parsed from the trusted upstream or reconstructed by decompressing
/// a peer's compressed block. This is the `decompress_state` the spec's
/// `recompress_block` operation takes.
#[derive(Debug, Clone)]
pub struct DecompressState {
    pub header: [u8; HEADER_LEN],
    pub hash: Hash256,
    pub txs: Vec<Bytes>,
}

impl DecompressState {
    pub fn embedded_merkle_root(&self) -> Hash256 {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.header[MERKLE_ROOT_RANGE]);
        out
    }

    /// Only double-SHA256 identity is computed here, never script or
    /// signature validation: recomputes the merkle root over each
    /// transaction's identity hash and compares it to the header's embedded
    /// root.
    pub fn merkle_matches(&self) -> bool {
        let leaves: Vec<Hash256> = self.txs.iter().map(|tx| double_sha256(tx)).collect();
        merkle_root(&leaves) == self.embedded_merkle_root()
    }
}

/// Parses the raw, uncompressed block format the trusted upstream hands to
/// the orchestrator: `header(80) || varint(tx_count) || (varint(len) ||
/// bytes)*`.
pub fn parse_raw_block(mut bytes: &[u8]) -> Result<DecompressState, CompressError> {
    if bytes.len() < HEADER_LEN {
        return Err(CompressError::HeaderTruncated)
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    bytes.advance(HEADER_LEN);

    let tx_count = read_varint(&mut bytes)?;
    let mut txs = Vec::with_capacity(tx_count as usize);
    for _ in 0..tx_count {
        let len = read_varint(&mut bytes)? as usize;
        if bytes.remaining() < len {
            return Err(CompressError::TruncatedTx)
        }
        txs.push(Bytes::copy_from_slice(&bytes[..len]));
        bytes.advance(len);
    }

    let mut full = Vec::with_capacity(HEADER_LEN);
    full.extend_from_slice(&header);
    let hash = double_sha256(&full);
    Ok(DecompressState { header, hash, txs })
}
