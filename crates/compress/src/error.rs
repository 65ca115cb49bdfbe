use thiserror::Error;

/// Errors surfaced while parsing a raw or compressed block.
///
/// Like [`relay_wire::WireError`], every variant is peer-local: the block's
/// source is disconnected with the error's display string, logged as an
/// `INSANE` record, and the error never propagates past the orchestrator.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("block shorter than the 80-byte header")]
    HeaderTruncated,
    #[error("truncated varint")]
    TruncatedVarint,
    #[error("truncated transaction body")]
    TruncatedTx,
    #[error("merkle root does not match block header")]
    MerkleMismatch,
    #[error("transaction index {0} has no known entry")]
    UnknownTxReference(u64),
    #[error("unrecognized transaction marker byte {0:#x}")]
    BadMarker(u8),
}
