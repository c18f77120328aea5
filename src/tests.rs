//! Integration-style tests exercising the wire codec and compression
//! wrappers through their public surface: frame boundary scenarios and
//! round-trip laws that don't depend on a live socket.

use crate::wire::codec::{encode_mpub, encode_rdy};
use crate::wire::compression::CompressedReader;
use crate::{Frame, Reader};

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
    reader.feed(&[0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x4F, 0x4B]);
    let frame = reader.get().unwrap().unwrap();
    assert!(matches!(&frame, Frame::Response(body) if body.as_ref() == b"OK"));
    assert!(frame.is_ok());
    assert!(reader.get().unwrap().is_none());
}

#[test]
fn frame_split_across_chunks() {
    let mut reader = Reader::new();
    reader.feed(&[0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00]);
    assert!(reader.get().unwrap().is_none());
    reader.feed(&[0x4F, 0x4B]);
    let frame = reader.get().unwrap().unwrap();
    assert!(frame.is_ok());
}

#[test]
fn heartbeat_frame_is_recognized_and_not_a_message() {
    let mut reader = Reader::new();
    reader.feed(&frame_bytes(0, b"_heartbeat_"));
    let frame = reader.get().unwrap().unwrap();
    assert!(frame.is_heartbeat());
    assert!(!matches!(frame, Frame::Message(_)));
}

#[test]
fn message_frame_carries_timestamp_attempts_id_and_body() {
    let mut reader = Reader::new();
    let mut body = Vec::new();
    body.extend_from_slice(&1i64.to_be_bytes());
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(b"0123456789abcdef");
    body.extend_from_slice(b"hi");
    reader.feed(&frame_bytes(2, &body));

    let frame = reader.get().unwrap().unwrap();
    match frame {
        Frame::Message(msg) => {
            assert_eq!(msg.timestamp, 1);
            assert_eq!(msg.attempts, 1);
            assert_eq!(msg.id_str(), "0123456789abcdef");
            assert_eq!(msg.body.as_ref(), b"hi");
        }
        other => panic!("expected a message frame, got {other:?}"),
    }
}

#[test]
fn error_frame_splits_code_from_message() {
    let mut reader = Reader::new();
    reader.feed(&frame_bytes(1, b"E_FIN_FAILED not found"));
    let frame = reader.get().unwrap().unwrap();
    match frame {
        Frame::Error { code, message } => {
            assert_eq!(code, "E_FIN_FAILED");
            assert_eq!(message.as_ref(), b"not found");
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
}

#[test]
fn mpub_encodes_command_line_then_count_prefixed_bodies() {
    let cmd = encode_mpub("t", &[b"a", b"bb"]);
    let mut expected = b"MPUB t\n".to_vec();
    let composite_len: i32 = 4 + (4 + 1) + (4 + 2); // count field + each length-prefixed body
    expected.extend_from_slice(&composite_len.to_be_bytes());
    expected.extend_from_slice(&2i32.to_be_bytes());
    expected.extend_from_slice(&1i32.to_be_bytes());
    expected.extend_from_slice(b"a");
    expected.extend_from_slice(&2i32.to_be_bytes());
    expected.extend_from_slice(b"bb");
    assert_eq!(cmd.as_ref(), expected.as_slice());
}

#[test]
fn rdy_command_round_trips_through_the_encoder() {
    let cmd = encode_rdy(42);
    assert_eq!(cmd.as_ref(), b"RDY 42\n");
}

#[test]
fn deflate_compression_round_trips_across_a_sync_flush_boundary() {
    let mut codec = CompressedReader::deflate(6);
    let plain = frame_bytes(0, b"OK");
    let on_wire = codec.encode(&plain).unwrap();
    codec.feed(&on_wire).unwrap();
    let frame = codec.get().unwrap().unwrap();
    assert!(frame.is_ok());
    assert!(codec.get().unwrap().is_none());
}

#[test]
fn snappy_compression_round_trips_across_a_sync_flush_boundary() {
    let mut codec = CompressedReader::snappy();
    let plain = frame_bytes(0, b"OK");
    let on_wire = codec.encode(&plain).unwrap();
    codec.feed(&on_wire).unwrap();
    let frame = codec.get().unwrap().unwrap();
    assert!(frame.is_ok());
    assert!(codec.get().unwrap().is_none());
}

#[test]
fn topic_and_channel_names_validate_through_the_public_api() {
    use crate::topic::{Channel, Topic};
    use std::str::FromStr;

    assert!(Topic::from_str("events.v1").is_ok());
    assert!(Channel::from_str("worker#ephemeral").unwrap().is_ephemeral());
    assert!(Topic::from_str("bad topic").is_err());
}
