use bytes::Bytes;

/// Four magic bytes that open every relay frame.
pub const MAGIC_BYTES: [u8; 4] = *b"RLY1";

/// Upper bound on a single frame's payload length, guarding against a
/// malicious or buggy peer claiming an unbounded length.
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

/// Message type tags carried in the frame header, in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Version = 0,
    MaxVersion = 1,
    Sponsor = 2,
    Block = 3,
    Transaction = 4,
    EndBlock = 5,
    Ping = 6,
    Pong = 7,
}

impl MessageType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Version,
            1 => Self::MaxVersion,
            2 => Self::Sponsor,
            3 => Self::Block,
            4 => Self::Transaction,
            5 => Self::EndBlock,
            6 => Self::Ping,
            7 => Self::Pong,
            _ => return None,
        })
    }
}

/// A fully decoded relay protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Protocol version string, sent by both sides on connect and echoed back.
    Version(String),
    /// Advisory carrying the sender's preferred version string.
    MaxVersion(String),
    /// Sponsor advertisement string, piggy-backed on transaction traffic.
    Sponsor(String),
    /// A compressed block, in the wire form produced by one compressor variant.
    Block(Bytes),
    /// A compressed (or literal) transaction announcement.
    Transaction(Bytes),
    /// Trailer that terminates a `Block` frame.
    EndBlock,
    /// Keepalive request carrying an opaque nonce.
    Ping(u64),
    /// Keepalive reply echoing a `Ping`'s nonce.
    Pong(u64),
}

impl RelayMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Version(_) => MessageType::Version,
            Self::MaxVersion(_) => MessageType::MaxVersion,
            Self::Sponsor(_) => MessageType::Sponsor,
            Self::Block(_) => MessageType::Block,
            Self::Transaction(_) => MessageType::Transaction,
            Self::EndBlock => MessageType::EndBlock,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
        }
    }
}
