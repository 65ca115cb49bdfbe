use relay_wire::WireError;
use thiserror::Error;

/// Errors surfaced while driving a single peer connection.
///
/// Every variant is peer-local: the connection task disconnects the peer
/// with the error's display string as the reason and never lets the error
/// reach the orchestrator or the registry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("peer declared unrecognized version {0:?}")]
    UnknownVersion(String),
    #[error("peer echoed our own preferred version as MAX_VERSION")]
    MaxVersionMisuse,
    #[error("message received before VERSION handshake completed")]
    NotNegotiated,
    #[error("peer connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
