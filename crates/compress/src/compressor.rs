use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use relay_fas::FlaggedArraySet;
use relay_wire::{double_sha256, Hash256};

use crate::block::DecompressState;
use crate::error::CompressError;
use crate::varint::{read_varint, write_varint};
use crate::version::CompressorConfig;

/// Transaction already known to this compressor's peers is referenced by
/// position; a transaction this compressor has never sent is sent literally.
const MARKER_LITERAL: u8 = 0x00;
const MARKER_INDEX_REF: u8 = 0x01;

/// How many blocks' worth of hashes each compressor remembers, purely to
/// suppress re-announcing a block it has already relayed.
const RECENT_BLOCK_HISTORY: usize = 64;

/// Transactions a compressor keeps as its shared dictionary with peers of its
/// matching protocol version. The spec leaves the exact capacity
/// unspecified; this mirrors the block-relative FAS sizing used elsewhere.
pub const DEFAULT_KNOWN_TX_CAPACITY: usize = 30_000;

/// The two forms `relay_node_connected` replays for each previously-learned
/// transaction: an older handshake-only form the original protocol kept
/// around for newly-connected peers, followed by the standard wire form.
#[derive(Debug, Clone)]
pub struct TxReplay {
    pub handshake_form: Bytes,
    pub standard_form: Bytes,
}

/// A stateful block/transaction encoder for one protocol variant.
pub struct Compressor {
    config: CompressorConfig,
    /// Held behind an `Arc` so the orchestrator can register it with the
    /// process-wide `Deduper` without this crate depending on that crate.
    known_txs: Arc<FlaggedArraySet>,
    recent_blocks: Mutex<VecDeque<Hash256>>,
    blocks_sent: AtomicU64,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("config", &self.config)
            .field("known_txs_len", &self.known_txs.len())
            .field("blocks_sent", &self.blocks_sent.load(Ordering::Relaxed))
            .finish()
    }
}

impl Compressor {
    pub fn new(config: CompressorConfig, known_tx_capacity: usize) -> Self {
        Self {
            config,
            known_txs: Arc::new(FlaggedArraySet::new(known_tx_capacity, false)),
            recent_blocks: Mutex::new(VecDeque::with_capacity(RECENT_BLOCK_HISTORY)),
            blocks_sent: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> CompressorConfig {
        self.config
    }

    /// The shared-dictionary FAS backing this compressor, for registration
    /// with a process-wide deduplication sweeper.
    pub fn known_txs(&self) -> &Arc<FlaggedArraySet> {
        &self.known_txs
    }

    pub fn was_tx_sent(&self, hash: &Hash256) -> bool {
        self.known_txs.contains_hash(hash)
    }

    pub fn was_block_sent(&self, hash: &Hash256) -> bool {
        self.recent_blocks.lock().contains(hash)
    }

    pub fn block_sent(&self, hash: Hash256) {
        let mut recent = self.recent_blocks.lock();
        if recent.len() == RECENT_BLOCK_HISTORY {
            recent.pop_front();
        }
        recent.push_back(hash);
        self.blocks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    /// Produces this version's transaction announcement, or `None` if its
    /// peers are already believed to know the transaction.
    pub fn get_relay_transaction(&self, tx: &[u8]) -> Option<Bytes> {
        let hash = double_sha256(tx);
        if self.known_txs.contains_hash(&hash) {
            return None
        }
        self.known_txs.add(Bytes::copy_from_slice(tx), false);
        Some(self.encode_tx_standard_form(tx))
    }

    fn encode_tx_standard_form(&self, tx: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(tx.len() + 1);
        buf.put_slice(tx);
        if self.config.use_flags_and_smaller_max {
            buf.put_u8(0);
        }
        buf.freeze()
    }

    /// Given a full block from the trusted upstream, validates it (when
    /// `check_merkle`) and produces this version's compressed wire form.
    pub fn maybe_compress_block(
        &self,
        bytes: &[u8],
        check_merkle: bool,
    ) -> (Bytes, Option<String>) {
        let state = match crate::block::parse_raw_block(bytes) {
            Ok(s) => s,
            Err(e) => return (Bytes::new(), Some(e.to_string())),
        };
        if check_merkle && !state.merkle_matches() {
            return (Bytes::new(), Some(CompressError::MerkleMismatch.to_string()))
        }
        if self.was_block_sent(&state.hash) {
            return (Bytes::new(), Some("block already sent".to_string()))
        }

        let compressed = self.encode_block(&state);
        self.block_sent(state.hash);
        (compressed, None)
    }

    /// Re-emits an already-decompressed block (received from an untrusted
    /// relay peer) for this version's peers. A result of 80 bytes or fewer
    /// is a rejection whose reason is carried in those bytes.
    pub fn recompress_block(&self, state: &DecompressState) -> Bytes {
        if self.was_block_sent(&state.hash) {
            return Bytes::from_static(b"already sent")
        }
        let compressed = self.encode_block(state);
        self.block_sent(state.hash);
        compressed
    }

    fn encode_block(&self, state: &DecompressState) -> Bytes {
        let mut buf = BytesMut::with_capacity(crate::block::HEADER_LEN + state.txs.len() * 8);
        buf.put_slice(&state.header);
        write_varint(&mut buf, state.txs.len() as u64);

        // `freeze_indexes_during_block` controls whether a transaction
        // learned earlier in this same block is visible for index-reference
        // to later transactions in it, or whether the whole block is encoded
        // against a single frozen snapshot of the dictionary.
        let mut newly_learned = Vec::new();
        for tx in &state.txs {
            let hash = double_sha256(tx);
            if let Some(index) = self.index_of_known(&hash) {
                buf.put_u8(MARKER_INDEX_REF);
                write_varint(&mut buf, index);
                if self.config.use_flags_and_smaller_max {
                    buf.put_u8(0);
                }
            } else {
                buf.put_u8(MARKER_LITERAL);
                write_varint(&mut buf, tx.len() as u64);
                buf.put_slice(tx);
                if self.config.freeze_indexes_during_block {
                    newly_learned.push(tx.clone());
                } else {
                    self.known_txs.add(tx.clone(), false);
                }
            }
        }
        for tx in newly_learned {
            self.known_txs.add(tx, false);
        }

        buf.freeze()
    }

    fn index_of_known(&self, hash: &Hash256) -> Option<u64> {
        if !self.known_txs.contains_hash(hash) {
            return None
        }
        // `contains_hash` only proves membership; find the live position by
        // scanning, mirroring the read path `get_by_index` expects callers
        // to resolve references through.
        let mut found = None;
        let mut i = 0usize;
        self.known_txs.for_each(|tx| {
            if found.is_none() && double_sha256(tx) == *hash {
                found = Some(i as u64);
            }
            i += 1;
        });
        found
    }

    /// Decodes a compressed block, resolving index references against this
    /// compressor's dictionary (the mirror of what the sending peer's
    /// version is assumed to know).
    pub fn decompress_block(&self, compressed: &[u8]) -> Result<DecompressState, CompressError> {
        if compressed.len() < crate::block::HEADER_LEN {
            return Err(CompressError::HeaderTruncated)
        }
        let mut header = [0u8; crate::block::HEADER_LEN];
        header.copy_from_slice(&compressed[..crate::block::HEADER_LEN]);
        let mut rest = &compressed[crate::block::HEADER_LEN..];

        let tx_count = read_varint(&mut rest)?;
        let mut txs = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            if rest.is_empty() {
                return Err(CompressError::TruncatedTx)
            }
            let marker = rest[0];
            rest = &rest[1..];
            match marker {
                MARKER_LITERAL => {
                    let len = read_varint(&mut rest)? as usize;
                    if rest.len() < len {
                        return Err(CompressError::TruncatedTx)
                    }
                    let tx = Bytes::copy_from_slice(&rest[..len]);
                    rest = &rest[len..];
                    self.known_txs.add(tx.clone(), false);
                    txs.push(tx);
                }
                MARKER_INDEX_REF => {
                    let index = read_varint(&mut rest)?;
                    if self.config.use_flags_and_smaller_max {
                        if rest.is_empty() {
                            return Err(CompressError::TruncatedTx)
                        }
                        rest = &rest[1..];
                    }
                    let tx = self
                        .known_txs
                        .get_by_index(index as usize)
                        .ok_or(CompressError::UnknownTxReference(index))?;
                    txs.push(tx);
                }
                other => return Err(CompressError::BadMarker(other)),
            }
        }

        let hash = double_sha256(&header);
        Ok(DecompressState { header, hash, txs })
    }

    /// On handshake completion, every transaction this compressor has
    /// learned is replayed to the new peer in the order learned.
    pub fn relay_node_connected(&self) -> Vec<TxReplay> {
        let mut out = Vec::new();
        self.known_txs.for_each(|tx| {
            out.push(TxReplay {
                handshake_form: tx.clone(),
                standard_form: self.encode_tx_standard_form(tx),
            });
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::parse_raw_block;
    use crate::version::COMPRESSOR_CONFIGS;
    use bytes::BufMut;

    fn raw_block(txs: &[&[u8]]) -> Vec<u8> {
        let leaves: Vec<Hash256> = txs.iter().map(|t| double_sha256(t)).collect();
        let root = relay_wire::merkle_root(&leaves);
        let mut header = [0u8; crate::block::HEADER_LEN];
        header[36..68].copy_from_slice(&root);

        let mut buf = BytesMut::new();
        buf.put_slice(&header);
        write_varint(&mut buf, txs.len() as u64);
        for t in txs {
            write_varint(&mut buf, t.len() as u64);
            buf.put_slice(t);
        }
        buf.to_vec()
    }

    #[test]
    fn get_relay_transaction_suppresses_resend() {
        let c = Compressor::new(COMPRESSOR_CONFIGS[0], 100);
        let tx = b"a transaction";
        assert!(c.get_relay_transaction(tx).is_some());
        assert!(c.get_relay_transaction(tx).is_none());
        assert!(c.was_tx_sent(&double_sha256(tx)));
    }

    #[test]
    fn maybe_compress_block_rejects_bad_merkle_root() {
        let c = Compressor::new(COMPRESSOR_CONFIGS[0], 100);
        let mut raw = raw_block(&[b"tx a", b"tx b"]);
        raw[40] ^= 0xff;
        let (bytes, reason) = c.maybe_compress_block(&raw, true);
        assert!(bytes.is_empty());
        assert!(reason.is_some());
    }

    #[test]
    fn compress_then_decompress_round_trips_transactions() {
        let c = Compressor::new(COMPRESSOR_CONFIGS[1], 100);
        let raw = raw_block(&[b"tx a", b"tx b", b"tx c"]);
        let (compressed, reason) = c.maybe_compress_block(&raw, true);
        assert!(reason.is_none());

        let d = Compressor::new(COMPRESSOR_CONFIGS[1], 100);
        let decompressed = d.decompress_block(&compressed).unwrap();
        assert_eq!(decompressed.txs, vec![Bytes::from_static(b"tx a"), Bytes::from_static(b"tx b"), Bytes::from_static(b"tx c")]);
    }

    #[test]
    fn recompress_after_compress_is_byte_identical() {
        // Property 6: recompress_block(decompress(compress(b))) ==
        // compress(b) for any block that wasn't rejected.
        let c = Compressor::new(COMPRESSOR_CONFIGS[2], 100);
        let raw = raw_block(&[b"alpha", b"beta", b"gamma"]);
        let original_state = parse_raw_block(&raw).unwrap();

        let sender = Compressor::new(COMPRESSOR_CONFIGS[2], 100);
        let (compressed_once, reason) = sender.maybe_compress_block(&raw, true);
        assert!(reason.is_none());

        // The receiving side decodes against its own dictionary, which is
        // empty, so every tx arrives literal and gets learned.
        let receiver = Compressor::new(COMPRESSOR_CONFIGS[2], 100);
        let decompressed = receiver.decompress_block(&compressed_once).unwrap();
        assert_eq!(decompressed.txs, original_state.txs);

        // Recompressing for a third, equally empty-dictionary compressor
        // must produce the identical bytes a direct `maybe_compress_block`
        // would have, since neither has learned any of this block's txs yet.
        let third = Compressor::new(COMPRESSOR_CONFIGS[2], 100);
        let recompressed = third.recompress_block(&decompressed);
        let (direct, _) = {
            let reference = Compressor::new(COMPRESSOR_CONFIGS[2], 100);
            reference.maybe_compress_block(&raw, true)
        };
        assert_eq!(recompressed, direct);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn tx_strategy() -> impl Strategy<Value = Vec<u8>> {
            proptest::collection::vec(any::<u8>(), 1..30)
        }

        proptest! {
            // Property 6, generalized across random transaction sets and every
            // compressor configuration: a block that compresses cleanly
            // recompresses to identical bytes once decompressed against a
            // fresh, empty-dictionary peer.
            #[test]
            fn recompress_matches_compress_for_any_block(txs in proptest::collection::vec(tx_strategy(), 1..6)) {
                for config in COMPRESSOR_CONFIGS {
                    let tx_refs: Vec<&[u8]> = txs.iter().map(|t| t.as_slice()).collect();
                    let raw = raw_block(&tx_refs);

                    let sender = Compressor::new(config, 1000);
                    let (compressed_once, reason) = sender.maybe_compress_block(&raw, true);
                    prop_assert!(reason.is_none());

                    let receiver = Compressor::new(config, 1000);
                    let decompressed = receiver.decompress_block(&compressed_once).unwrap();

                    let third = Compressor::new(config, 1000);
                    let recompressed = third.recompress_block(&decompressed);

                    let reference = Compressor::new(config, 1000);
                    let (direct, _) = reference.maybe_compress_block(&raw, true);
                    prop_assert_eq!(recompressed, direct);
                }
            }
        }
    }

    #[test]
    fn relay_node_connected_replays_in_insertion_order() {
        let c = Compressor::new(COMPRESSOR_CONFIGS[0], 100);
        c.get_relay_transaction(b"first");
        c.get_relay_transaction(b"second");

        let replay = c.relay_node_connected();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].handshake_form, Bytes::from_static(b"first"));
        assert_eq!(replay[1].handshake_form, Bytes::from_static(b"second"));
    }
}
