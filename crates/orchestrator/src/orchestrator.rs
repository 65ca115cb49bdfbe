use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use relay_compress::CompressorSet;
use relay_dedup::{Deduper, DEFAULT_SWEEP_INTERVAL};
use relay_net::{ConnectionPhase, OrchestratorHandle, PeerHandle, PeerRegistry, ProvideBlockResult, SendToken};
use relay_wire::{double_sha256, Hash256};

use crate::upstream::UpstreamSource;

/// Number of protocol versions fanned out to, and the order blocks and
/// transactions are relayed in: index 0 first, since its compressed size and
/// timestamp are what the block-ingestion log line reports.
const FANOUT_ORDER: [usize; 3] = [0, 1, 2];

/// Glues the trusted upstream connection, the mempool hint channel, and the
/// downstream peer registry together. One instance is shared across every
/// connection's read loop and the upstream/mempool tasks.
pub struct Orchestrator {
    compressors: CompressorSet,
    registry: PeerRegistry,
    /// Transaction hashes admitted from the mempool hint channel that are
    /// still awaiting the matching full transaction from upstream. Held
    /// alone, never nested under the registry or a compressor lock.
    waiting_to_broadcast: parking_lot::Mutex<HashSet<Hash256>>,
    sponsor: String,
    /// `host` field of the `BLOCK` ingestion log line for upstream-sourced
    /// blocks, matching the original's use of the trusted peer's address.
    trusted_host: String,
    upstream: Arc<dyn UpstreamSource>,
    blocks_ingested: AtomicU64,
    /// Process-wide sweeper coalescing identical transactions held by more
    /// than one of the three compressors' dictionaries. Kept alive for the
    /// orchestrator's lifetime; never swept on its own schedule in tests.
    deduper: Deduper,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("trusted_host", &self.trusted_host)
            .field("registry_len", &self.registry.len())
            .field("blocks_ingested", &self.blocks_ingested.load(Ordering::Relaxed))
            .finish()
    }
}

impl Orchestrator {
    /// Builds a fresh orchestrator with an empty peer registry and a new set
    /// of per-version compressors, registering each compressor's known-
    /// transaction dictionary with a freshly spawned deduplication sweeper.
    pub fn new(sponsor: String, trusted_host: String, upstream: Arc<dyn UpstreamSource>) -> Self {
        let compressors = CompressorSet::new();
        let deduper = Deduper::spawn(DEFAULT_SWEEP_INTERVAL);
        for (_, compressor) in compressors.iter() {
            let dyn_set: Arc<dyn relay_fas::Dedupable> = compressor.known_txs().clone();
            deduper.register(&dyn_set);
        }

        Self {
            compressors,
            registry: PeerRegistry::new(),
            waiting_to_broadcast: parking_lot::Mutex::new(HashSet::new()),
            sponsor,
            trusted_host,
            upstream,
            blocks_ingested: AtomicU64::new(0),
            deduper,
        }
    }

    /// Runs one deduplication sweep immediately, outside its regular
    /// schedule. Exposed for tests.
    pub fn sweep_dedup_once(&self) -> usize {
        self.deduper.sweep_once()
    }

    /// The connected-peer registry, for the accept loop and the cull tick.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// The three per-version compressors, mostly useful for tests.
    pub fn compressors(&self) -> &CompressorSet {
        &self.compressors
    }

    /// A transaction hash arrived on the mempool hint channel: remember it as
    /// awaiting broadcast and ask the trusted source for the full payload.
    pub async fn admit_mempool_hash(&self, hash: Hash256) {
        self.waiting_to_broadcast.lock().insert(hash);
        if let Err(e) = self.upstream.request_transaction(hash).await {
            tracing::warn!(target: "relay_orchestrator", error = %e, "failed to request transaction from upstream");
        }
    }

    /// A complete block arrived from the trusted upstream source: compress it
    /// once per protocol version, in ascending version order, and fan each
    /// version's bytes out to that version's live peers.
    pub async fn on_upstream_block(&self, raw: Bytes) -> ProvideBlockResult {
        let received_at = now_millis();
        let mut first_version_wire_bytes = 0usize;
        let block_hash = relay_compress::parse_raw_block(&raw).ok().map(|s| s.hash);

        for &index in &FANOUT_ORDER {
            let compressor = self.compressors.get(index);
            let (compressed, rejected) = compressor.maybe_compress_block(&raw, true);
            if let Some(reason) = rejected {
                if index == 0 {
                    let hash_hex = block_hash.map(hex_string).unwrap_or_default();
                    tracing::warn!(target: "relay::block", "{hash_hex} INSANE {reason} TRUSTEDP2P");
                    return ProvideBlockResult { first_version_wire_bytes: 0, queued_at_millis: received_at }
                }
                tracing::debug!(target: "relay_orchestrator", %reason, version_index = index, "skipping fan-out for one protocol version");
                continue
            }

            if index == 0 {
                first_version_wire_bytes = compressed.len();
            }

            for peer in self.registry.live_peers_for_compressor(index) {
                let mut token = peer.acquire_send_token().await;
                if let Err(e) = peer.receive_block(&mut token, compressed.clone()).await {
                    tracing::warn!(target: "relay_orchestrator", peer = peer.host_key(), error = %e, "failed to relay block to peer");
                }
            }
        }

        let processed_at = now_millis();
        let total = self.blocks_ingested.fetch_add(1, Ordering::Relaxed) + 1;
        let hash_hex = block_hash.map(hex_string).unwrap_or_default();
        let host = self.trusted_host.as_str();
        let wire_bytes = raw.len();
        let first_version_bytes = first_version_wire_bytes;
        let block_bytes = raw.len();
        let process_ms = processed_at.saturating_sub(received_at);
        tracing::info!(
            target: "relay::block",
            total_blocks = total,
            "{hash_hex} BLOCK {received_at} {host} TRUSTEDP2P {wire_bytes} / {first_version_bytes} / {block_bytes} TIMES: 0 {process_ms}"
        );

        ProvideBlockResult { first_version_wire_bytes, queued_at_millis: received_at }
    }

    /// A full transaction arrived from the trusted upstream source, in
    /// response to an earlier mempool hint: fan it out per version if it was
    /// actually awaited.
    pub async fn on_upstream_transaction(&self, tx: Bytes) {
        let hash = double_sha256(&tx);
        let was_awaited = self.waiting_to_broadcast.lock().remove(&hash);
        if !was_awaited {
            return
        }
        self.fan_out_transaction(&tx).await;
    }

    async fn fan_out_transaction(&self, tx: &[u8]) {
        for &index in &FANOUT_ORDER {
            let compressor = self.compressors.get(index);
            let Some(wire) = compressor.get_relay_transaction(tx) else { continue };
            for peer in self.registry.live_peers_for_compressor(index) {
                let mut token = peer.acquire_send_token().await;
                if let Err(e) = peer.receive_transaction(&mut token, wire.clone(), 0, &self.sponsor).await {
                    tracing::warn!(target: "relay_orchestrator", peer = peer.host_key(), error = %e, "failed to relay transaction to peer");
                }
            }
        }
    }
}

#[async_trait]
impl OrchestratorHandle for Orchestrator {
    async fn connected(&self, peer: &Arc<PeerHandle>, compressor_index: usize, token: &mut SendToken<'_>) {
        let replay = self.compressors.get(compressor_index).relay_node_connected();
        for entry in replay {
            if let Err(e) = token.send(relay_wire::RelayMessage::Transaction(entry.handshake_form)).await {
                tracing::warn!(target: "relay_orchestrator", peer = peer.host_key(), error = %e, "handshake replay failed");
                return
            }
            if let Err(e) = token.send(relay_wire::RelayMessage::Transaction(entry.standard_form)).await {
                tracing::warn!(target: "relay_orchestrator", peer = peer.host_key(), error = %e, "handshake replay failed");
                return
            }
        }
    }

    /// A downstream peer announced a complete block it compressed with its
    /// own negotiated version. Decompress it against that version's
    /// dictionary, validate the embedded merkle root, and recompress once per
    /// remaining version for fan-out to every other live peer.
    async fn provide_block(&self, peer: &Arc<PeerHandle>, bytes: Bytes) -> ProvideBlockResult {
        let received_at = now_millis();
        let Some(index) = peer.compressor_index() else {
            return ProvideBlockResult { first_version_wire_bytes: 0, queued_at_millis: received_at }
        };

        let state = match self.compressors.get(index).decompress_block(&bytes) {
            Ok(state) => state,
            Err(e) => {
                let host = peer.host_key();
                tracing::warn!(target: "relay::block", "_ INSANE {e} UNTRUSTEDRELAY {host}");
                peer.set_phase(ConnectionPhase::Disconnecting);
                return ProvideBlockResult { first_version_wire_bytes: 0, queued_at_millis: received_at }
            }
        };
        if !state.merkle_matches() {
            let hash_hex = hex_string(state.hash);
            let host = peer.host_key();
            tracing::warn!(target: "relay::block", "{hash_hex} INSANE merkle-mismatch UNTRUSTEDRELAY {host}");
            peer.set_phase(ConnectionPhase::Disconnecting);
            return ProvideBlockResult { first_version_wire_bytes: 0, queued_at_millis: received_at }
        }

        let mut first_version_wire_bytes = 0usize;
        for &fanout_index in &FANOUT_ORDER {
            let compressed = self.compressors.get(fanout_index).recompress_block(&state);
            // A result at or under the raw header length is the rejection
            // sentinel (e.g. "already sent"), not a wire-encodable block.
            if compressed.len() <= relay_compress::HEADER_LEN {
                tracing::debug!(target: "relay_orchestrator", version_index = fanout_index, "skipping fan-out for one protocol version");
                continue
            }
            if fanout_index == 0 {
                first_version_wire_bytes = compressed.len();
            }
            for target in self.registry.live_peers_for_compressor(fanout_index) {
                if Arc::ptr_eq(&target, peer) {
                    continue
                }
                let mut token = target.acquire_send_token().await;
                if let Err(e) = target.receive_block(&mut token, compressed.clone()).await {
                    tracing::warn!(target: "relay_orchestrator", peer = target.host_key(), error = %e, "failed to relay peer block onward");
                }
            }
        }

        self.blocks_ingested.fetch_add(1, Ordering::Relaxed);
        ProvideBlockResult { first_version_wire_bytes, queued_at_millis: received_at }
    }

    /// A downstream peer announced a transaction it believes its peers don't
    /// know; relay it upstream and fan it out to every other version.
    async fn provide_transaction(&self, peer: &Arc<PeerHandle>, bytes: Bytes) {
        if let Err(e) = self.upstream.send_transaction(bytes.clone()).await {
            tracing::warn!(target: "relay_orchestrator", peer = peer.host_key(), error = %e, "failed to relay peer transaction upstream");
        }
        self.fan_out_transaction(&bytes).await;
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Lowercase hex rendering of a block hash for the `BLOCK`/`INSANE` log
/// lines, matching the source's `HASH_FORMAT`/`HASH_PRINT` macros.
fn hex_string(hash: Hash256) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_wire::merkle_root;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingUpstream {
        requested: StdMutex<Vec<Hash256>>,
        sent: StdMutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl UpstreamSource for RecordingUpstream {
        async fn request_transaction(&self, hash: Hash256) -> Result<(), crate::error::UpstreamError> {
            self.requested.lock().unwrap().push(hash);
            Ok(())
        }
        async fn send_transaction(&self, tx: Bytes) -> Result<(), crate::error::UpstreamError> {
            self.sent.lock().unwrap().push(tx);
            Ok(())
        }
    }

    /// Builds a raw block with single-byte varints; every fixture transaction
    /// here is well under 128 bytes so this is a faithful LEB128 encoding.
    fn raw_block(txs: &[&[u8]]) -> Bytes {
        let leaves: Vec<Hash256> = txs.iter().map(|t| double_sha256(t)).collect();
        let root = merkle_root(&leaves);
        let mut header = [0u8; 80];
        header[36..68].copy_from_slice(&root);

        let mut buf = bytes::BytesMut::new();
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&[txs.len() as u8]);
        for t in txs {
            assert!(t.len() < 128);
            buf.extend_from_slice(&[t.len() as u8]);
            buf.extend_from_slice(t);
        }
        buf.freeze()
    }

    #[tokio::test]
    async fn upstream_block_with_no_peers_still_advances_first_version_size() {
        let upstream = Arc::new(RecordingUpstream::default());
        let orchestrator = Orchestrator::new("sponsor".to_string(), "trusted.example".to_string(), upstream);

        let raw = raw_block(&[b"tx a", b"tx b"]);
        let result = orchestrator.on_upstream_block(raw).await;
        assert!(result.first_version_wire_bytes > 0);
    }

    #[tokio::test]
    async fn mempool_hash_is_forgotten_once_broadcast() {
        let upstream = Arc::new(RecordingUpstream::default());
        let orchestrator = Orchestrator::new("sponsor".to_string(), "trusted.example".to_string(), upstream.clone());

        let tx = Bytes::from_static(b"a relayed transaction");
        let hash = double_sha256(&tx);
        orchestrator.admit_mempool_hash(hash).await;
        assert_eq!(upstream.requested.lock().unwrap().len(), 1);
        assert!(orchestrator.waiting_to_broadcast.lock().contains(&hash));

        orchestrator.on_upstream_transaction(tx).await;
        assert!(!orchestrator.waiting_to_broadcast.lock().contains(&hash));
    }

    #[tokio::test]
    async fn dedup_sweep_coalesces_a_transaction_learned_by_two_compressors() {
        let upstream = Arc::new(RecordingUpstream::default());
        let orchestrator = Orchestrator::new("sponsor".to_string(), "trusted.example".to_string(), upstream);

        let tx = b"shared across two compressor dictionaries";
        orchestrator.compressors.get(0).get_relay_transaction(tx);
        orchestrator.compressors.get(1).get_relay_transaction(tx);

        assert!(orchestrator.sweep_dedup_once() > 0);
    }

    #[tokio::test]
    async fn unawaited_upstream_transaction_is_ignored() {
        let upstream = Arc::new(RecordingUpstream::default());
        let orchestrator = Orchestrator::new("sponsor".to_string(), "trusted.example".to_string(), upstream);
        // Never admitted via the mempool channel, so no version should learn it.
        orchestrator.on_upstream_transaction(Bytes::from_static(b"unsolicited")).await;
        assert!(!orchestrator.compressors.get(0).was_tx_sent(&double_sha256(b"unsolicited")));
    }
}
