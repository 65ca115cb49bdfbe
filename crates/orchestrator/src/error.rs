use thiserror::Error;

/// Errors surfaced by the connection to the trusted upstream source or the
/// mempool hint channel. Both are expected to drop and reconnect; in-flight
/// broadcast-waiting entries persist across a reconnect.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream framing error: {0}")]
    Framing(String),
}
