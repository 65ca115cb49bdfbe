use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::message::{MessageType, RelayMessage, MAGIC_BYTES, MAX_FRAME_LEN};

/// `magic(4) || type(4, big-endian) || length(4, big-endian) || payload`.
const HEADER_LEN: usize = 12;

/// `tokio_util` codec for [`RelayMessage`] frames over a `Framed<TcpStream, _>`.
///
/// Stateless between frames: the decoder re-parses the header each call and
/// only waits on `src` accumulating enough bytes, the usual pattern for a
/// length-delimited protocol.
#[derive(Debug, Default)]
pub struct RelayCodec {
    _private: (),
}

impl RelayCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<RelayMessage> for RelayCodec {
    type Error = WireError;

    fn encode(&mut self, item: RelayMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let msg_type = item.message_type();
        let payload = encode_payload(item);
        if payload.len() > MAX_FRAME_LEN as usize {
            return Err(WireError::FrameTooLarge(payload.len() as u32, MAX_FRAME_LEN));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u32(msg_type as u32);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for RelayCodec {
    type Item = RelayMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None)
        }

        let magic = &src[0..4];
        if magic != MAGIC_BYTES {
            return Err(WireError::BadMagic)
        }

        let type_tag = u32::from_be_bytes(src[4..8].try_into().expect("4 bytes"));
        let len = u32::from_be_bytes(src[8..12].try_into().expect("4 bytes"));
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len, MAX_FRAME_LEN))
        }

        let frame_len = HEADER_LEN + len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None)
        }

        let msg_type = MessageType::from_u32(type_tag).ok_or(WireError::UnknownType(type_tag))?;
        src.advance(HEADER_LEN);
        let payload = src.split_to(len as usize).freeze();
        decode_payload(msg_type, payload).map(Some)
    }
}

fn encode_payload(msg: RelayMessage) -> Bytes {
    match msg {
        RelayMessage::Version(s) | RelayMessage::MaxVersion(s) | RelayMessage::Sponsor(s) => {
            Bytes::from(s.into_bytes())
        }
        RelayMessage::Block(b) | RelayMessage::Transaction(b) => b,
        RelayMessage::EndBlock => Bytes::new(),
        RelayMessage::Ping(nonce) | RelayMessage::Pong(nonce) => {
            Bytes::copy_from_slice(&nonce.to_be_bytes())
        }
    }
}

fn decode_payload(msg_type: MessageType, payload: Bytes) -> Result<RelayMessage, WireError> {
    let as_string = |b: Bytes| String::from_utf8(b.to_vec()).map_err(|_| WireError::InvalidUtf8);
    let as_nonce = |b: Bytes| -> Result<u64, WireError> {
        let bytes: [u8; 8] = b.as_ref().try_into().map_err(|_| WireError::Truncated)?;
        Ok(u64::from_be_bytes(bytes))
    };

    Ok(match msg_type {
        MessageType::Version => RelayMessage::Version(as_string(payload)?),
        MessageType::MaxVersion => RelayMessage::MaxVersion(as_string(payload)?),
        MessageType::Sponsor => RelayMessage::Sponsor(as_string(payload)?),
        MessageType::Block => RelayMessage::Block(payload),
        MessageType::Transaction => RelayMessage::Transaction(payload),
        MessageType::EndBlock => RelayMessage::EndBlock,
        MessageType::Ping => RelayMessage::Ping(as_nonce(payload)?),
        MessageType::Pong => RelayMessage::Pong(as_nonce(payload)?),
    })
}
