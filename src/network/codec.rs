// src/network/codec.rs
// C2 Frame Codec: [u32 length BE][u8 type][payload]. `length` covers
// type+payload and must be <= 4 MiB; larger frames tear the connection down.

use crate::error::CoreError;
use bytes::{Buf, BytesMut};

pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;
const LEN_PREFIX: usize = 4;
const TYPE_BYTE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 0,
    HandshakeAck = 1,
    Block = 2,
    Transaction = 3,
    BftPrepare = 4,
    BftCommit = 5,
    FindNode = 6,
    FindNodeResponse = 7,
    Ping = 8,
    Pong = 9,
}

impl FrameType {
    fn from_u8(b: u8) -> Option<Self> {
        use FrameType::*;
        Some(match b {
            0 => Handshake,
            1 => HandshakeAck,
            2 => Block,
            3 => Transaction,
            4 => BftPrepare,
            5 => BftCommit,
            6 => FindNode,
            7 => FindNodeResponse,
            8 => Ping,
            9 => Pong,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    /// None for unknown type ids — counted and ignored, never fatal.
    pub typ: Option<FrameType>,
    pub raw_type: u8,
    pub payload: Vec<u8>,
}

pub fn encode(typ: FrameType, payload: &[u8]) -> Result<Vec<u8>, CoreError> {
    let body_len = TYPE_BYTE + payload.len();
    if body_len as u64 > MAX_FRAME_LEN as u64 {
        return Err(CoreError::InvalidFrame(format!(
            "frame of {body_len} bytes exceeds MAX_FRAME_LEN"
        )));
    }
    let mut out = Vec::with_capacity(LEN_PREFIX + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.push(typ as u8);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Per-connection incremental decoder. Owns the byte buffer; `feed` appends
/// then extracts as many complete frames as are available, leaving the
/// partial tail in place.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// count of unknown frame types seen, for diagnostics — never fatal.
    pub unknown_type_count: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, CoreError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < LEN_PREFIX {
                break;
            }
            let len = u32::from_be_bytes(self.buf[..LEN_PREFIX].try_into().unwrap());
            if len == 0 {
                return Err(CoreError::InvalidFrame("zero-length frame".into()));
            }
            if len > MAX_FRAME_LEN {
                return Err(CoreError::InvalidFrame(format!(
                    "frame length {len} exceeds MAX_FRAME_LEN {MAX_FRAME_LEN}"
                )));
            }
            let total = LEN_PREFIX + len as usize;
            if self.buf.len() < total {
                break; // partial tail stays in the buffer
            }

            self.buf.advance(LEN_PREFIX);
            let body = self.buf.split_to(len as usize);
            let raw_type = body[0];
            let payload = body[TYPE_BYTE..].to_vec();
            let typ = FrameType::from_u8(raw_type);
            if typ.is_none() {
                self.unknown_type_count += 1;
            }
            frames.push(Frame {
                typ,
                raw_type,
                payload,
            });
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_frame() {
        let encoded = encode(FrameType::Ping, b"hello").unwrap();
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].typ, Some(FrameType::Ping));
        assert_eq!(frames[0].payload, b"hello");
    }

    #[test]
    fn partial_tail_is_retained() {
        let encoded = encode(FrameType::Pong, b"world").unwrap();
        let mut dec = FrameDecoder::new();
        let (head, tail) = encoded.split_at(encoded.len() - 2);
        assert!(dec.feed(head).unwrap().is_empty());
        let frames = dec.feed(tail).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"world");
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut dec = FrameDecoder::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        bytes.push(0);
        assert!(dec.feed(&bytes).is_err());
    }

    #[test]
    fn max_frame_len_exactly_accepted() {
        let payload = vec![0u8; (MAX_FRAME_LEN - 1) as usize];
        let encoded = encode(FrameType::Block, &payload).unwrap();
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn unknown_type_is_counted_not_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.push(200); // unknown type id
        bytes.push(7);
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].typ, None);
        assert_eq!(dec.unknown_type_count, 1);
    }

    #[test]
    fn multiple_frames_in_one_feed() {
        let mut bytes = encode(FrameType::Ping, b"a").unwrap();
        bytes.extend(encode(FrameType::Pong, b"b").unwrap());
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 2);
    }
}
