use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use futures::stream::SplitSink;
use futures::SinkExt;
use parking_lot::Mutex;
use relay_wire::{RelayCodec, RelayMessage};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::ConnectionError;

/// Connection lifecycle. There is no transition back from `Disconnecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Negotiating,
    Live,
    Disconnecting,
}

type Sink = SplitSink<Framed<TcpStream, RelayCodec>, RelayMessage>;

/// Proof that the caller holds a peer's outbound lock.
///
/// Acquiring this is the only way to write to a peer; holding it across
/// multiple sends (as `receive_block` does for its block and `END_BLOCK`
/// trailer) is how the spec's "atomically under one token" ordering
/// guarantee is realized in the type system rather than by convention.
pub struct SendToken<'a> {
    sink: tokio::sync::MutexGuard<'a, Sink>,
}

impl std::fmt::Debug for SendToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendToken").finish_non_exhaustive()
    }
}

impl SendToken<'_> {
    pub async fn send(&mut self, msg: RelayMessage) -> Result<(), ConnectionError> {
        self.sink.send(msg).await.map_err(ConnectionError::from)
    }
}

/// State for one downstream peer connection.
pub struct PeerHandle {
    host_key: String,
    phase: Mutex<ConnectionPhase>,
    compressor_index: Mutex<Option<usize>>,
    sends_sponsor: AtomicBool,
    tx_sent_since_connect: AtomicU64,
    disconnect_complete: AtomicBool,
    duplicate_logged_at: Mutex<Option<Instant>>,
    sink: tokio::sync::Mutex<Sink>,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("host_key", &self.host_key)
            .field("phase", &*self.phase.lock())
            .field("compressor_index", &*self.compressor_index.lock())
            .finish()
    }
}

impl PeerHandle {
    pub fn new(host_key: String, sink: Sink) -> Self {
        Self {
            host_key,
            phase: Mutex::new(ConnectionPhase::Negotiating),
            compressor_index: Mutex::new(None),
            sends_sponsor: AtomicBool::new(false),
            tx_sent_since_connect: AtomicU64::new(0),
            disconnect_complete: AtomicBool::new(false),
            duplicate_logged_at: Mutex::new(None),
            sink: tokio::sync::Mutex::new(sink),
        }
    }

    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        *self.phase.lock() = phase;
    }

    pub fn compressor_index(&self) -> Option<usize> {
        *self.compressor_index.lock()
    }

    pub fn bind_version(&self, compressor_index: usize, sends_sponsor: bool) {
        *self.compressor_index.lock() = Some(compressor_index);
        self.sends_sponsor.store(sends_sponsor, Ordering::Relaxed);
    }

    pub fn sends_sponsor(&self) -> bool {
        self.sends_sponsor.load(Ordering::Relaxed)
    }

    pub fn tx_sent_since_connect(&self) -> u64 {
        self.tx_sent_since_connect.load(Ordering::Relaxed)
    }

    pub fn mark_disconnect_complete(&self) {
        self.disconnect_complete.store(true, Ordering::Relaxed);
    }

    pub fn disconnect_complete(&self) -> bool {
        self.disconnect_complete.load(Ordering::Relaxed)
    }

    /// Returns `true` at most once per 60-second window per peer, letting
    /// the registry log duplicate-connect attempts without flooding.
    pub fn note_duplicate_connect(&self, now: Instant) -> bool {
        let mut logged_at = self.duplicate_logged_at.lock();
        let should_log = match *logged_at {
            Some(last) => now.duration_since(last) >= std::time::Duration::from_secs(60),
            None => true,
        };
        if should_log {
            *logged_at = Some(now);
        }
        should_log
    }

    /// Acquires the peer's outbound lock. The returned token is the only way
    /// to send; it is held across the block/`END_BLOCK` pair and across a
    /// `connected` callback's transaction replay to guarantee ordering with
    /// any concurrently in-flight send.
    pub async fn acquire_send_token(&self) -> SendToken<'_> {
        SendToken { sink: self.sink.lock().await }
    }

    /// Sends a transaction, then opportunistically piggy-backs the sponsor
    /// string on the first send of a fan-out batch (`batch_index == 0`) if
    /// this is also the very first transaction ever sent to this peer and
    /// its negotiated version opted into sponsor advertisements.
    pub async fn receive_transaction(
        &self,
        token: &mut SendToken<'_>,
        tx: bytes::Bytes,
        batch_index: u64,
        sponsor: &str,
    ) -> Result<(), ConnectionError> {
        if self.phase() != ConnectionPhase::Live {
            return Ok(())
        }
        token.send(RelayMessage::Transaction(tx)).await?;
        let already_sent = self.tx_sent_since_connect.fetch_add(1, Ordering::Relaxed);
        if batch_index == 0 && already_sent == 0 && self.sends_sponsor() {
            token.send(RelayMessage::Sponsor(sponsor.to_string())).await?;
        }
        Ok(())
    }

    /// Writes a compressed block and its `END_BLOCK` trailer under one held
    /// token, so no other send can interleave between them.
    pub async fn receive_block(
        &self,
        token: &mut SendToken<'_>,
        compressed: bytes::Bytes,
    ) -> Result<(), ConnectionError> {
        if self.phase() != ConnectionPhase::Live {
            return Ok(())
        }
        token.send(RelayMessage::Block(compressed)).await?;
        token.send(RelayMessage::EndBlock).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_connect_throttles_to_once_per_window() {
        // Exercised without a real socket since the throttle is pure state.
        let logged_at: Mutex<Option<Instant>> = Mutex::new(None);
        let note = |now: Instant| -> bool {
            let mut g = logged_at.lock();
            let should = match *g {
                Some(last) => now.duration_since(last) >= std::time::Duration::from_secs(60),
                None => true,
            };
            if should {
                *g = Some(now);
            }
            should
        };

        let t0 = Instant::now();
        assert!(note(t0));
        assert!(!note(t0 + std::time::Duration::from_secs(1)));
        assert!(note(t0 + std::time::Duration::from_secs(61)));
    }
}
