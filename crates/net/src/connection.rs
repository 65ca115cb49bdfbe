use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::StreamExt;
use relay_wire::{RelayCodec, RelayMessage};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::ConnectionError;
use crate::peer::{ConnectionPhase, PeerHandle, SendToken};

/// Result of handing a complete block to the orchestrator: the size and
/// timestamp of the first protocol version's compressed form, reported back
/// for the block-ingestion log line.
#[derive(Debug, Clone, Copy)]
pub struct ProvideBlockResult {
    pub first_version_wire_bytes: usize,
    pub queued_at_millis: u64,
}

/// Callbacks a connection's read loop invokes into the orchestrator.
///
/// Defined here, not in the orchestrator crate, so `relay-net` stays free of
/// a dependency on it; the orchestrator implements this trait against its
/// own state.
#[async_trait]
pub trait OrchestratorHandle: Send + Sync {
    /// Invoked once the peer has negotiated a version and moved to `Live`,
    /// with the caller's own send token passed through so the transaction
    /// replay happens under the same lock that guarded the VERSION/MAX_VERSION
    /// reply, with nothing else able to interleave a send to this peer.
    async fn connected(&self, peer: &Arc<PeerHandle>, compressor_index: usize, token: &mut SendToken<'_>);

    async fn provide_block(&self, peer: &Arc<PeerHandle>, bytes: Bytes) -> ProvideBlockResult;

    async fn provide_transaction(&self, peer: &Arc<PeerHandle>, bytes: Bytes);
}

/// Drives one peer's read loop until the connection closes or a protocol
/// violation disconnects it.
pub async fn run_connection(
    peer: Arc<PeerHandle>,
    mut stream: SplitStream<Framed<TcpStream, RelayCodec>>,
    orchestrator: Arc<dyn OrchestratorHandle>,
) -> Result<(), ConnectionError> {
    while let Some(msg) = stream.next().await {
        let msg = msg?;
        if let Err(e) = handle_message(&peer, msg, orchestrator.as_ref()).await {
            peer.set_phase(ConnectionPhase::Disconnecting);
            return Err(e)
        }
    }
    peer.set_phase(ConnectionPhase::Disconnecting);
    Ok(())
}

async fn handle_message(
    peer: &Arc<PeerHandle>,
    msg: RelayMessage,
    orchestrator: &dyn OrchestratorHandle,
) -> Result<(), ConnectionError> {
    match msg {
        RelayMessage::Version(tag) => {
            let info = relay_compress::lookup_version(&tag)
                .ok_or_else(|| ConnectionError::UnknownVersion(tag.clone()))?;

            let mut token = peer.acquire_send_token().await;
            token.send(RelayMessage::Version(tag.clone())).await?;
            if tag != relay_compress::PREFERRED_VERSION_TAG {
                token
                    .send(RelayMessage::MaxVersion(
                        relay_compress::PREFERRED_VERSION_TAG.to_string(),
                    ))
                    .await?;
            }

            peer.bind_version(info.compressor_index, info.sends_sponsor);
            peer.set_phase(ConnectionPhase::Live);
            orchestrator.connected(peer, info.compressor_index, &mut token).await;
            Ok(())
        }
        RelayMessage::MaxVersion(tag) => {
            if tag == relay_compress::PREFERRED_VERSION_TAG {
                return Err(ConnectionError::MaxVersionMisuse)
            }
            tracing::debug!(target: "relay_net", peer = peer.host_key(), %tag, "peer advertised MAX_VERSION");
            Ok(())
        }
        RelayMessage::Sponsor(_) | RelayMessage::Pong(_) => Ok(()),
        RelayMessage::Ping(nonce) => {
            let mut token = peer.acquire_send_token().await;
            token.send(RelayMessage::Pong(nonce)).await?;
            Ok(())
        }
        RelayMessage::Block(bytes) => {
            if peer.phase() != ConnectionPhase::Live {
                return Err(ConnectionError::NotNegotiated)
            }
            orchestrator.provide_block(peer, bytes).await;
            Ok(())
        }
        RelayMessage::Transaction(bytes) => {
            if peer.phase() != ConnectionPhase::Live {
                return Err(ConnectionError::NotNegotiated)
            }
            orchestrator.provide_transaction(peer, bytes).await;
            Ok(())
        }
        RelayMessage::EndBlock => Ok(()),
    }
}
