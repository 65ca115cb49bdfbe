use thiserror::Error;

/// Errors surfaced while framing or parsing a relay wire message.
///
/// Every variant here is peer-local: the caller should disconnect the
/// offending peer with the error's display string as the reason and must
/// never let it propagate further.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unknown message type {0:#x}")]
    UnknownType(u32),
    #[error("frame length {0} exceeds maximum {1}")]
    FrameTooLarge(u32, u32),
    #[error("message payload is not valid utf-8")]
    InvalidUtf8,
    #[error("truncated frame")]
    Truncated,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
