use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use relay_wire::Hash256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::UpstreamError;

/// A whole block or transaction handed over by the trusted upstream source.
///
/// The real bitcoin peer-to-peer codec is out of scope here — it is treated
/// as a black-box message framer that hands over whole payloads plus their
/// full hashes — so this crate only needs *some* concrete connection that
/// can plausibly carry that handoff. [`TcpUpstreamSource`] is a minimal
/// length-prefixed stand-in, not a reimplementation of the bitcoin wire
/// protocol.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Block(Bytes),
    Transaction(Bytes),
}

const TAG_BLOCK: u8 = 0x01;
const TAG_TRANSACTION: u8 = 0x02;
const TAG_REQUEST_TRANSACTION: u8 = 0x03;

/// Outbound half of the trusted upstream connection: requesting a
/// transaction by hash (after a mempool hint) and pushing a
/// peer-rebroadcast transaction back upstream.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn request_transaction(&self, hash: Hash256) -> Result<(), UpstreamError>;
    async fn send_transaction(&self, tx: Bytes) -> Result<(), UpstreamError>;
}

/// TCP-backed upstream connection using a simple `tag(1) || varint-ish
/// length(4, big-endian) || payload` framing that stands in for the real
/// bitcoin P2P codec.
pub struct TcpUpstreamSource {
    write: Mutex<OwnedWriteHalf>,
}

impl std::fmt::Debug for TcpUpstreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpUpstreamSource").finish_non_exhaustive()
    }
}

impl TcpUpstreamSource {
    /// Connects to the trusted host, returning the outbound handle and a
    /// stream of inbound block/transaction events.
    pub async fn connect(host: &str, port: u16) -> Result<(Self, UpstreamEventReader), UpstreamError> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read, write) = stream.into_split();
        Ok((Self { write: Mutex::new(write) }, UpstreamEventReader { read }))
    }

    async fn write_frame(&self, tag: u8, payload: &[u8]) -> Result<(), UpstreamError> {
        let mut header = [0u8; 5];
        header[0] = tag;
        header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        let mut write = self.write.lock().await;
        write.write_all(&header).await?;
        write.write_all(payload).await?;
        Ok(())
    }
}

#[async_trait]
impl UpstreamSource for TcpUpstreamSource {
    async fn request_transaction(&self, hash: Hash256) -> Result<(), UpstreamError> {
        self.write_frame(TAG_REQUEST_TRANSACTION, &hash).await
    }

    async fn send_transaction(&self, tx: Bytes) -> Result<(), UpstreamError> {
        self.write_frame(TAG_TRANSACTION, &tx).await
    }
}

/// Reads [`UpstreamEvent`]s off the trusted connection's inbound half.
pub struct UpstreamEventReader {
    read: OwnedReadHalf,
}

impl std::fmt::Debug for UpstreamEventReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamEventReader").finish_non_exhaustive()
    }
}

impl UpstreamEventReader {
    pub async fn next_event(&mut self) -> Result<Option<UpstreamEvent>, UpstreamError> {
        let mut header = [0u8; 5];
        if let Err(e) = self.read.read_exact(&mut header).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None)
            }
            return Err(e.into())
        }
        let tag = header[0];
        let len = u32::from_be_bytes(header[1..5].try_into().expect("4 bytes")) as usize;

        let mut payload = BytesMut::zeroed(len);
        self.read.read_exact(&mut payload).await?;
        let payload = payload.freeze();

        match tag {
            TAG_BLOCK => Ok(Some(UpstreamEvent::Block(payload))),
            TAG_TRANSACTION => Ok(Some(UpstreamEvent::Transaction(payload))),
            other => Err(UpstreamError::Framing(format!("unexpected upstream tag {other:#x}"))),
        }
    }
}
