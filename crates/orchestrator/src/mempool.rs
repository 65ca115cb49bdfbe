use relay_wire::Hash256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::UpstreamError;

/// Single-byte keepalive the spec requires every 10 seconds on the mempool
/// connection.
const KEEPALIVE_BYTE: u8 = 0x42;

/// Persistent outbound connection to `(trusted_host, mempool_port)` that
/// streams 32-byte transaction hashes, one per admission to the downstream
/// broadcast-waiting set.
pub struct MempoolClient {
    write: Mutex<OwnedWriteHalf>,
}

impl std::fmt::Debug for MempoolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MempoolClient").finish_non_exhaustive()
    }
}

impl MempoolClient {
    pub async fn connect(host: &str, port: u16) -> Result<(Self, MempoolHashStream), UpstreamError> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read, write) = stream.into_split();
        Ok((Self { write: Mutex::new(write) }, MempoolHashStream { read }))
    }

    pub async fn keep_alive_ping(&self) -> Result<(), UpstreamError> {
        self.write.lock().await.write_all(&[KEEPALIVE_BYTE]).await?;
        Ok(())
    }
}

/// Inbound half: a bare stream of 32-byte transaction hashes, no framing.
pub struct MempoolHashStream {
    read: OwnedReadHalf,
}

impl std::fmt::Debug for MempoolHashStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MempoolHashStream").finish_non_exhaustive()
    }
}

impl MempoolHashStream {
    pub async fn next_hash(&mut self) -> Result<Option<Hash256>, UpstreamError> {
        let mut hash = [0u8; 32];
        match self.read.read_exact(&mut hash).await {
            Ok(_) => Ok(Some(hash)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn streams_hashes_and_sends_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = socket.into_split();
            write.write_all(&[9u8; 32]).await.unwrap();

            let mut ping = [0u8; 1];
            read.read_exact(&mut ping).await.unwrap();
            assert_eq!(ping[0], KEEPALIVE_BYTE);
        });

        let (client, mut hashes) = MempoolClient::connect("127.0.0.1", addr.port()).await.unwrap();
        let hash = hashes.next_hash().await.unwrap().unwrap();
        assert_eq!(hash, [9u8; 32]);

        client.keep_alive_ping().await.unwrap();
        server.await.unwrap();
    }
}
