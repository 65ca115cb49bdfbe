use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::peer::{ConnectionPhase, PeerHandle};

/// Suffix that marks a connecting host as an uptime-monitoring bot rather
/// than a genuine relay peer.
const REJECTED_SUFFIX: &str = ".uptimerobot.com";

/// Outcome of attempting to register a new connection.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    RejectedMonitoringHost,
    RejectedDuplicate { should_log: bool },
}

/// Map from host key to connected peer. Its lock serializes accept, cull,
/// and fan-out traversal, matching the registry-lock-first ordering in the
/// concurrency model: registry lock, then any per-compressor FAS lock, then
/// a peer's own send token — never the reverse.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<PeerHandle>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether `host` (not yet keyed by port) may connect, and under
    /// what key it should be registered. Whitelisted hosts are keyed by
    /// `host:port` so the same address can hold multiple connections.
    pub fn admit(
        &self,
        host: &str,
        port: u16,
        whitelisted: bool,
        now: Instant,
    ) -> (AdmitOutcome, String) {
        if host.ends_with(REJECTED_SUFFIX) {
            return (AdmitOutcome::RejectedMonitoringHost, host.to_string())
        }

        let key = if whitelisted { format!("{host}:{port}") } else { host.to_string() };

        let peers = self.peers.lock();
        if let Some(existing) = peers.get(&key) {
            let should_log = existing.note_duplicate_connect(now);
            return (AdmitOutcome::RejectedDuplicate { should_log }, key)
        }
        (AdmitOutcome::Admitted, key)
    }

    pub fn insert(&self, key: String, peer: Arc<PeerHandle>) {
        self.peers.lock().insert(key, peer);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<PeerHandle>> {
        self.peers.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every `Disconnecting` peer that has finished tearing down.
    /// Intended to run on the 10-second cull tick.
    pub fn cull(&self) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|_, p| {
            !(p.phase() == ConnectionPhase::Disconnecting && p.disconnect_complete())
        });
        before - peers.len()
    }

    /// Snapshot of every live, non-disconnecting peer bound to
    /// `compressor_index`, for fan-out.
    pub fn live_peers_for_compressor(&self, compressor_index: usize) -> Vec<Arc<PeerHandle>> {
        self.peers
            .lock()
            .values()
            .filter(|p| {
                p.phase() == ConnectionPhase::Live && p.compressor_index() == Some(compressor_index)
            })
            .cloned()
            .collect()
    }

    /// Snapshot of every live, non-disconnecting peer, for transaction
    /// fan-out across all versions.
    pub fn live_peers(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.lock().values().filter(|p| p.phase() == ConnectionPhase::Live).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_wire::RelayCodec;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    /// Builds a `PeerHandle` over a genuine loopback TCP connection, since
    /// `PeerHandle`'s sink is tied to `TcpStream` rather than a generic
    /// transport (the spec treats raw socket I/O as out-of-scope plumbing).
    async fn dummy_peer(host_key: &str) -> Arc<PeerHandle> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });

        let framed = Framed::new(server, RelayCodec::new());
        let (sink, _stream) = futures::StreamExt::split(framed);
        Arc::new(PeerHandle::new(host_key.to_string(), sink))
    }

    #[tokio::test]
    async fn rejects_uptimerobot_suffix() {
        let registry = PeerRegistry::new();
        let (outcome, _key) = registry.admit("host.uptimerobot.com", 8336, false, Instant::now());
        assert_eq!(outcome, AdmitOutcome::RejectedMonitoringHost);
    }

    #[tokio::test]
    async fn rejects_and_throttles_duplicate_connect() {
        let registry = PeerRegistry::new();
        let peer = dummy_peer("1.2.3.4").await;
        registry.insert("1.2.3.4".to_string(), peer);

        let now = Instant::now();
        let (outcome, _) = registry.admit("1.2.3.4", 8336, false, now);
        assert_eq!(outcome, AdmitOutcome::RejectedDuplicate { should_log: true });

        let (outcome, _) = registry.admit("1.2.3.4", 8336, false, now);
        assert_eq!(outcome, AdmitOutcome::RejectedDuplicate { should_log: false });
    }

    #[tokio::test]
    async fn whitelisted_hosts_key_by_host_and_port() {
        let registry = PeerRegistry::new();
        let peer = dummy_peer("10.0.0.1:1000").await;
        registry.insert("10.0.0.1:1000".to_string(), peer);

        let (outcome, key) = registry.admit("10.0.0.1", 2000, true, Instant::now());
        assert_eq!(outcome, AdmitOutcome::Admitted);
        assert_eq!(key, "10.0.0.1:2000");
    }

    #[tokio::test]
    async fn cull_removes_only_completed_disconnects() {
        let registry = PeerRegistry::new();
        let still_live = dummy_peer("a").await;
        let done = dummy_peer("b").await;
        done.set_phase(ConnectionPhase::Disconnecting);
        done.mark_disconnect_complete();
        let pending = dummy_peer("c").await;
        pending.set_phase(ConnectionPhase::Disconnecting);

        registry.insert("a".to_string(), still_live);
        registry.insert("b".to_string(), done);
        registry.insert("c".to_string(), pending);

        assert_eq!(registry.cull(), 1);
        assert_eq!(registry.len(), 2);
    }
}
