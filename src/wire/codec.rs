// NSQ V2 wire codec - separates the framed byte-stream parser from connection
// and consumer logic. A `Reader` is fed raw bytes as they arrive off the
// socket and yields complete `Frame`s one at a time; `encode_command` and its
// specialised helpers turn typed command values into the exact bytes to send.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use thiserror::Error;

/// Magic bytes sent once, immediately after the TCP connection is opened.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Size of the `size` and `frame_type` header fields, in bytes.
pub const SIZE_FIELD_LEN: usize = 4;
pub const MSG_HEADER_LEN: usize = 8 + 2 + 16; // timestamp + attempts + id

/// Sanity bound on a single frame's payload, to avoid unbounded buffering
/// from a misbehaving or malicious peer.
pub const MAX_FRAME_SIZE: i32 = 16 * 1024 * 1024;

pub const HEARTBEAT_BODY: &[u8] = b"_heartbeat_";
pub const OK_BODY: &[u8] = b"OK";
pub const CLOSE_WAIT_BODY: &[u8] = b"CLOSE_WAIT";

/// NSQ frame type tag, the first four bytes of every frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

/// A decoded NSQ message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; 16],
    pub body: Bytes,
}

impl Message {
    /// The message id rendered as a string, for use in `FIN`/`REQ`/`TOUCH`.
    /// NSQ message ids are ASCII by convention; non-ASCII ids are rendered lossily.
    pub fn id_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.id)
    }
}

/// A single decoded frame from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error { code: String, message: Bytes },
    Message(Message),
}

impl Frame {
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Response(b) if b.as_ref() == OK_BODY)
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(b) if b.as_ref() == HEARTBEAT_BODY)
    }

    pub fn is_close_wait(&self) -> bool {
        matches!(self, Frame::Response(b) if b.as_ref() == CLOSE_WAIT_BODY)
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Frame::Response(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error { .. })
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Frame::Message(_))
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame")]
    Incomplete,
    #[error("invalid frame type: {0}")]
    InvalidFrameType(i32),
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: i32, max: i32 },
    #[error("negative frame size: {0}")]
    NegativeFrameSize(i32),
    #[error("malformed error frame: missing code separator")]
    MalformedErrorFrame,
    #[error("error frame code is not valid utf-8")]
    ErrorCodeUtf8(#[source] std::str::Utf8Error),
    #[error("message frame too short: {len} bytes, need at least {min}")]
    MessageTooShort { len: usize, min: usize },
}

/// Parser state: either waiting for the 4-byte size prefix, or waiting for
/// `payload_size` more bytes once the size has been read.
enum ParserState {
    AwaitingSize,
    AwaitingPayload { payload_size: usize },
}

/// Stateful, restartable frame parser. Feed it bytes as they arrive off the
/// socket in any chunking; `get()` pulls at most one complete frame per call.
pub struct Reader {
    buffer: BytesMut,
    state: ParserState,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    pub fn new() -> Self {
        Reader {
            buffer: BytesMut::new(),
            state: ParserState::AwaitingSize,
        }
    }

    /// Append a chunk of bytes read from the connection.
    pub fn feed(&mut self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Drain whatever bytes have been fed but not yet parsed into a frame,
    /// resetting to a fresh parser state. Used when switching codecs mid-
    /// stream (compression negotiated after `IDENTIFY`): any bytes read off
    /// the socket before the switch but not yet consumed belong to the new
    /// codec, not this one.
    pub fn take_unconsumed(&mut self) -> Bytes {
        self.state = ParserState::AwaitingSize;
        std::mem::take(&mut self.buffer).freeze()
    }

    /// Pull one complete frame out of the buffer, if one is available.
    pub fn get(&mut self) -> Result<Option<Frame>, CodecError> {
        if let ParserState::AwaitingSize = self.state {
            if self.buffer.len() < SIZE_FIELD_LEN {
                return Ok(None);
            }
            let size = (&self.buffer[..SIZE_FIELD_LEN]).get_i32();
            if size < 0 {
                return Err(CodecError::NegativeFrameSize(size));
            }
            if size > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge {
                    size,
                    max: MAX_FRAME_SIZE,
                });
            }
            self.state = ParserState::AwaitingPayload {
                payload_size: size as usize,
            };
        }

        let payload_size = match self.state {
            ParserState::AwaitingPayload { payload_size } => payload_size,
            ParserState::AwaitingSize => unreachable!(),
        };

        if self.buffer.len() < SIZE_FIELD_LEN + payload_size {
            return Ok(None);
        }

        let frame_type_raw = (&self.buffer[SIZE_FIELD_LEN..SIZE_FIELD_LEN + 4]).get_i32();
        let frame_type = FrameType::try_from(frame_type_raw)
            .map_err(|_| CodecError::InvalidFrameType(frame_type_raw))?;

        let payload_start = SIZE_FIELD_LEN + 4;
        let payload_end = SIZE_FIELD_LEN + payload_size;
        let frame = Self::parse_payload(frame_type, &self.buffer[payload_start..payload_end])?;

        let consumed = SIZE_FIELD_LEN + payload_size;
        let _ = self.buffer.split_to(consumed);
        self.state = ParserState::AwaitingSize;

        Ok(Some(frame))
    }

    fn parse_payload(frame_type: FrameType, body: &[u8]) -> Result<Frame, CodecError> {
        match frame_type {
            FrameType::Response => Ok(Frame::Response(Bytes::copy_from_slice(body))),
            FrameType::Error => Self::parse_error(body),
            FrameType::Message => Self::parse_message(body),
        }
    }

    fn parse_error(body: &[u8]) -> Result<Frame, CodecError> {
        let split_at = body
            .iter()
            .position(|&b| b == b' ')
            .ok_or(CodecError::MalformedErrorFrame)?;
        let (code, rest) = body.split_at(split_at);
        let message = &rest[1..];
        let code = std::str::from_utf8(code)
            .map_err(CodecError::ErrorCodeUtf8)?
            .to_string();
        Ok(Frame::Error {
            code,
            message: Bytes::copy_from_slice(message),
        })
    }

    fn parse_message(body: &[u8]) -> Result<Frame, CodecError> {
        if body.len() < MSG_HEADER_LEN {
            return Err(CodecError::MessageTooShort {
                len: body.len(),
                min: MSG_HEADER_LEN,
            });
        }
        let mut cur = Cursor::new(body);
        let timestamp = cur.get_i64();
        let attempts = cur.get_u16();
        let mut id = [0u8; 16];
        cur.copy_to_slice(&mut id);
        let body = Bytes::copy_from_slice(&cur.get_ref()[cur.position() as usize..]);
        Ok(Frame::Message(Message {
            timestamp,
            attempts,
            id,
            body,
        }))
    }
}

/// Outbound command body framing.
pub enum Body<'a> {
    None,
    Single(&'a [u8]),
    Multi(&'a [&'a [u8]]),
}

/// Encode a command to the exact bytes to write to the socket.
///
/// `name` is upper-cased; `args` are space-separated after the name; `body`
/// determines the trailing length-prefixed payload, if any (see module docs
/// on `MPUB`'s composite framing).
pub fn encode_command(name: &str, args: &[&str], body: Body<'_>) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(name.to_ascii_uppercase().as_bytes());
    for arg in args {
        buf.put_u8(b' ');
        buf.extend_from_slice(arg.as_bytes());
    }
    buf.put_u8(b'\n');

    match body {
        Body::None => {}
        Body::Single(data) => {
            buf.put_i32(data.len() as i32);
            buf.extend_from_slice(data);
        }
        Body::Multi(parts) => {
            let mut payload = BytesMut::new();
            payload.put_i32(parts.len() as i32);
            for part in parts {
                payload.put_i32(part.len() as i32);
                payload.extend_from_slice(part);
            }
            buf.put_i32(payload.len() as i32);
            buf.extend_from_slice(&payload);
        }
    }

    buf.freeze()
}

pub fn encode_identify(body: &[u8]) -> Bytes {
    encode_command("IDENTIFY", &[], Body::Single(body))
}

pub fn encode_auth(secret: &[u8]) -> Bytes {
    encode_command("AUTH", &[], Body::Single(secret))
}

pub fn encode_sub(topic: &str, channel: &str) -> Bytes {
    encode_command("SUB", &[topic, channel], Body::None)
}

pub fn encode_pub(topic: &str, body: &[u8]) -> Bytes {
    encode_command("PUB", &[topic], Body::Single(body))
}

pub fn encode_dpub(topic: &str, defer_ms: u64, body: &[u8]) -> Bytes {
    let defer = defer_ms.to_string();
    encode_command("DPUB", &[topic, &defer], Body::Single(body))
}

pub fn encode_mpub(topic: &str, bodies: &[&[u8]]) -> Bytes {
    encode_command("MPUB", &[topic], Body::Multi(bodies))
}

pub fn encode_rdy(count: u32) -> Bytes {
    let n = count.to_string();
    encode_command("RDY", &[&n], Body::None)
}

pub fn encode_fin(msg_id: &str) -> Bytes {
    encode_command("FIN", &[msg_id], Body::None)
}

pub fn encode_req(msg_id: &str, timeout_ms: u64) -> Bytes {
    let t = timeout_ms.to_string();
    encode_command("REQ", &[msg_id, &t], Body::None)
}

pub fn encode_touch(msg_id: &str) -> Bytes {
    encode_command("TOUCH", &[msg_id], Body::None)
}

pub fn encode_cls() -> Bytes {
    encode_command("CLS", &[], Body::None)
}

pub fn encode_nop() -> Bytes {
    encode_command("NOP", &[], Body::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(frame_type: i32, body: &[u8]) -> Vec<u8> {
        let size = (body.len() + 4) as i32;
        let mut out = Vec::new();
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&frame_type.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn single_frame_in_one_chunk() {
        let mut reader = Reader::new();
        reader.feed(&frame_bytes(0, b"OK"));
        let frame = reader.get().unwrap().unwrap();
        assert!(frame.is_ok());
        assert!(reader.get().unwrap().is_none());
    }

    #[test]
    fn frame_split_across_chunks() {
        let bytes = frame_bytes(0, b"OK");
        let mut reader = Reader::new();
        reader.feed(&bytes[..6]);
        assert!(reader.get().unwrap().is_none());
        reader.feed(&bytes[6..]);
        let frame = reader.get().unwrap().unwrap();
        assert!(frame.is_ok());
    }

    #[test]
    fn heartbeat_is_recognized_and_not_a_message() {
        let mut reader = Reader::new();
        reader.feed(&frame_bytes(0, HEARTBEAT_BODY));
        let frame = reader.get().unwrap().unwrap();
        assert!(frame.is_heartbeat());
        assert!(!frame.is_message());
    }

    #[test]
    fn message_frame_round_trip() {
        let mut body = Vec::new();
        body.extend_from_slice(&1i64.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(b"0123456789abcdef");
        body.extend_from_slice(b"hi");

        let mut reader = Reader::new();
        reader.feed(&frame_bytes(2, &body));
        let frame = reader.get().unwrap().unwrap();
        match frame {
            Frame::Message(msg) => {
                assert_eq!(msg.attempts, 1);
                assert_eq!(msg.id_str(), "0123456789abcdef");
                assert_eq!(&msg.body[..], b"hi");
            }
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[test]
    fn error_frame_splits_code_and_message() {
        let mut reader = Reader::new();
        reader.feed(&frame_bytes(1, b"E_FIN_FAILED not found"));
        let frame = reader.get().unwrap().unwrap();
        match frame {
            Frame::Error { code, message } => {
                assert_eq!(code, "E_FIN_FAILED");
                assert_eq!(&message[..], b"not found");
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_is_a_protocol_error() {
        let mut reader = Reader::new();
        reader.feed(&frame_bytes(99, b"x"));
        assert!(matches!(
            reader.get(),
            Err(CodecError::InvalidFrameType(99))
        ));
    }

    #[test]
    fn mpub_encodes_composite_body() {
        let encoded = encode_mpub("t", &[b"a", b"bb"]);
        assert!(encoded.starts_with(b"MPUB t\n"));
        let body = &encoded[7..];
        let total_len = i32::from_be_bytes(body[0..4].try_into().unwrap());
        assert_eq!(total_len as usize, body.len() - 4);
        let count = i32::from_be_bytes(body[4..8].try_into().unwrap());
        assert_eq!(count, 2);
        let len1 = i32::from_be_bytes(body[8..12].try_into().unwrap());
        assert_eq!(len1, 1);
        assert_eq!(&body[12..13], b"a");
        let len2 = i32::from_be_bytes(body[13..17].try_into().unwrap());
        assert_eq!(len2, 2);
        assert_eq!(&body[17..19], b"bb");
    }

    #[test]
    fn pub_encodes_length_prefixed_body() {
        let encoded = encode_pub("topic", b"hello");
        assert_eq!(&encoded[..], b"PUB topic\n\0\0\0\x05hello");
    }

    #[test]
    fn sub_has_no_body() {
        let encoded = encode_sub("topic", "channel");
        assert_eq!(&encoded[..], b"SUB topic channel\n");
    }

    #[test]
    fn rdy_encodes_integer_argument() {
        let encoded = encode_rdy(42);
        assert_eq!(&encoded[..], b"RDY 42\n");
    }

    #[test]
    fn command_names_are_uppercased() {
        let encoded = encode_command("nop", &[], Body::None);
        assert_eq!(&encoded[..], b"NOP\n");
    }
}
