#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for the frame codec, stream table and connection pool
//! Boundary conditions, malformed input and error scenarios

use bytes::{Bytes, BytesMut};
use covert_mux::core::codec::{FrameCodec, DELIMITER_LEN, MAX_WIRE_SEGMENT};
use covert_mux::core::frame::{next_seq, Frame, StreamId, CLOSE_MARKER, SEG_SIZE};
use covert_mux::error::ProtocolError;
use covert_mux::protocol::pool::{ConnectionPool, ConnectionRecord, InboundAction};
use covert_mux::utils::crypto::SessionSecret;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::codec::{Decoder, Encoder};

fn secret() -> SessionSecret {
    SessionSecret::from_bytes(b"ponmlkjihgfedcba").expect("valid secret")
}

fn codec() -> FrameCodec {
    FrameCodec::new(&[1u8; 32], &secret())
}

fn id(s: &str) -> StreamId {
    s.parse().unwrap()
}

fn data(stream: &str, seq: u16, payload: &'static [u8]) -> Frame {
    Frame::Data {
        id: id(stream),
        seq,
        payload: Bytes::from_static(payload),
    }
}

fn pool() -> (ConnectionPool, usize) {
    let mut pool = ConnectionPool::new(2);
    let slot = pool
        .register(ConnectionRecord::new(Arc::new(Notify::new())))
        .unwrap();
    (pool, slot)
}

// ============================================================================
// FRAME CODEC EDGE CASES
// ============================================================================

#[test]
fn test_empty_data_frame() {
    let mut c = codec();
    let mut wire = BytesMut::new();
    c.encode(data("ab", 0, b""), &mut wire).unwrap();
    assert_eq!(c.decode(&mut wire).unwrap(), Some(data("ab", 0, b"")));
}

#[test]
fn test_max_payload_fits_one_frame() {
    let payload = vec![0x5A; SEG_SIZE];
    let mut c = codec();
    let mut wire = BytesMut::new();
    assert_eq!(c.encode_chunk(id("ab"), 0, &payload, &mut wire).unwrap(), SEG_SIZE);
    assert!(wire.len() <= MAX_WIRE_SEGMENT + DELIMITER_LEN);
    assert_eq!(c.decode(&mut wire).unwrap().unwrap().payload_len(), SEG_SIZE);
}

#[test]
fn test_oversized_frame_rejected_on_encode() {
    let mut c = codec();
    let mut wire = BytesMut::new();
    let frame = Frame::Data {
        id: id("ab"),
        seq: 0,
        payload: Bytes::from(vec![0u8; SEG_SIZE + 1]),
    };
    assert!(matches!(
        c.encode(frame, &mut wire),
        Err(ProtocolError::FrameDecode(_))
    ));
}

#[test]
fn test_reserved_id_cannot_carry_data() {
    let mut c = codec();
    let mut wire = BytesMut::new();
    assert!(c.encode(data("00", 0, b"nope"), &mut wire).is_err());
    assert!(wire.is_empty());

    assert!(Frame::parse_plain(b"00000nope").is_err());
}

#[test]
fn test_close_marker_payload_is_shortened() {
    let mut c = codec();
    let mut wire = BytesMut::new();
    let consumed = c.encode_chunk(id("ab"), 3, CLOSE_MARKER, &mut wire).unwrap();
    assert_eq!(consumed, CLOSE_MARKER.len() - 1);

    match c.decode(&mut wire).unwrap().unwrap() {
        Frame::Data { payload, .. } => assert_eq!(&payload[..], &CLOSE_MARKER[..4]),
        other => panic!("expected data, got {other:?}"),
    }
}

#[test]
fn test_control_frames_decode() {
    let mut c = codec();
    let mut wire = BytesMut::new();
    c.encode(Frame::CloseStream { id: id("Qz") }, &mut wire).unwrap();
    c.encode(Frame::CloseConnection, &mut wire).unwrap();

    assert_eq!(
        c.decode(&mut wire).unwrap(),
        Some(Frame::CloseStream { id: id("Qz") })
    );
    assert_eq!(c.decode(&mut wire).unwrap(), Some(Frame::CloseConnection));
    assert!(c.decode(&mut wire).unwrap().is_none());
}

#[test]
fn test_malformed_segment_dropped_neighbours_survive() {
    let mut c = codec();
    let mut wire = BytesMut::new();
    c.encode(data("ab", 0, b"first"), &mut wire).unwrap();

    wire.extend_from_slice(b"!!not-base64!!");
    wire.extend_from_slice(c.delimiter().as_bytes());

    // valid base64, wrong key
    let mut stranger = FrameCodec::new(&[2u8; 32], &secret());
    stranger.encode(data("ab", 1, b"forged"), &mut wire).unwrap();

    c.encode(data("ab", 1, b"second"), &mut wire).unwrap();

    assert_eq!(c.decode(&mut wire).unwrap(), Some(data("ab", 0, b"first")));
    assert_eq!(c.decode(&mut wire).unwrap(), Some(data("ab", 1, b"second")));
    assert!(c.decode(&mut wire).unwrap().is_none());
    assert!(wire.is_empty());
}

#[test]
fn test_unterminated_garbage_is_bounded() {
    let mut c = codec();
    let mut wire = BytesMut::from(&vec![b'A'; MAX_WIRE_SEGMENT + DELIMITER_LEN + 1][..]);
    assert!(c.decode(&mut wire).unwrap().is_none());
    assert!(wire.is_empty());

    // stream resynchronises on the next real frame
    c.encode(data("ab", 0, b"after"), &mut wire).unwrap();
    assert_eq!(c.decode(&mut wire).unwrap(), Some(data("ab", 0, b"after")));
}

#[test]
fn test_decode_eof_discards_tail() {
    let mut c = codec();
    let mut wire = BytesMut::new();
    c.encode(data("ab", 0, b"done"), &mut wire).unwrap();
    wire.extend_from_slice(b"partial");

    assert_eq!(c.decode_eof(&mut wire).unwrap(), Some(data("ab", 0, b"done")));
    assert!(c.decode_eof(&mut wire).unwrap().is_none());
    assert!(wire.is_empty());
}

#[test]
fn test_different_secrets_use_different_delimiters() {
    let other = SessionSecret::from_bytes(b"ponmlkjihgfedcZZ").unwrap();
    let a = FrameCodec::new(&[1u8; 32], &secret());
    let b = FrameCodec::new(&[1u8; 32], &other);
    assert_ne!(a.delimiter(), b.delimiter());
}

// ============================================================================
// STREAM ID AND SEQUENCE EDGE CASES
// ============================================================================

#[test]
fn test_stream_id_validation() {
    assert!("a".parse::<StreamId>().is_err());
    assert!("abc".parse::<StreamId>().is_err());
    assert!("a-".parse::<StreamId>().is_err());
    assert!("00".parse::<StreamId>().unwrap().is_reserved());
    assert_eq!(id("Zz").to_string(), "Zz");
}

#[test]
fn test_sequence_wraps_after_999() {
    assert_eq!(next_seq(0), 1);
    assert_eq!(next_seq(998), 999);
    assert_eq!(next_seq(999), 0);

    let mut c = codec();
    let mut wire = BytesMut::new();
    c.encode(data("ab", 999, b"x"), &mut wire).unwrap();
    match c.decode(&mut wire).unwrap().unwrap() {
        Frame::Data { seq, .. } => assert_eq!(seq, 999),
        other => panic!("expected data, got {other:?}"),
    }
}

#[test]
fn test_non_digit_sequence_rejected() {
    assert!(Frame::parse_plain(b"ab0x1payload").is_err());
    assert!(Frame::parse_plain(b"ab").is_err());
}

// ============================================================================
// POOL EDGE CASES
// ============================================================================

#[test]
fn test_register_stream_without_connections() {
    let mut empty = ConnectionPool::new(1);
    assert!(matches!(
        empty.register_stream(),
        Err(ProtocolError::PoolExhausted)
    ));
}

#[test]
fn test_pool_full_rejects_registration() {
    let (mut pool, _) = pool();
    pool.register(ConnectionRecord::new(Arc::new(Notify::new())))
        .unwrap();
    assert!(!pool.has_room());
    assert!(matches!(
        pool.register(ConnectionRecord::new(Arc::new(Notify::new()))),
        Err(ProtocolError::PoolFull)
    ));
}

#[test]
fn test_enqueue_unknown_stream() {
    let (mut pool, _) = pool();
    assert!(matches!(
        pool.enqueue(id("qq"), b"x"),
        Err(ProtocolError::UnknownStream(_))
    ));
}

#[test]
fn test_inbound_for_unknown_stream_dropped() {
    let (mut pool, slot) = pool();
    assert_eq!(
        pool.handle_inbound(slot, data("qq", 0, b"lost")),
        InboundAction::Dropped
    );
}

#[test]
fn test_duplicate_sequence_dropped() {
    let (mut pool, slot) = pool();
    let s = pool.register_stream().unwrap();
    let first = Frame::Data { id: s, seq: 0, payload: Bytes::from_static(b"one") };
    let dup = Frame::Data { id: s, seq: 0, payload: Bytes::from_static(b"two") };

    assert_eq!(
        pool.handle_inbound(slot, first),
        InboundAction::Landed { id: s, seq: 0 }
    );
    assert_eq!(pool.handle_inbound(slot, dup), InboundAction::Dropped);
    assert_eq!(pool.drain_inbound(s), vec![Bytes::from_static(b"one")]);
}

#[test]
fn test_gap_holds_later_frames() {
    let (mut pool, slot) = pool();
    let s = pool.register_stream().unwrap();
    pool.handle_inbound(slot, Frame::Data { id: s, seq: 1, payload: Bytes::from_static(b"b") });
    assert!(pool.drain_inbound(s).is_empty());

    pool.handle_inbound(slot, Frame::Data { id: s, seq: 0, payload: Bytes::from_static(b"a") });
    assert_eq!(
        pool.drain_inbound(s),
        vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
    );
}

#[test]
fn test_remove_stream_twice() {
    let (mut pool, _) = pool();
    let s = pool.register_stream().unwrap();
    assert!(pool.remove_stream(s));
    assert!(!pool.remove_stream(s));
    assert!(pool.enqueue(s, b"late").is_err());
}

#[test]
fn test_write_cycle_on_non_preferred_slot_is_noop() {
    let (mut pool, slot) = pool();
    let other = pool
        .register(ConnectionRecord::new(Arc::new(Notify::new())))
        .unwrap();
    let s = pool.register_stream().unwrap();
    pool.enqueue(s, b"queued").unwrap();

    let idle = if pool.preferred() == Some(slot) { other } else { slot };
    let mut wire = BytesMut::new();
    assert_eq!(pool.write_cycle(idle, &mut codec(), &mut wire).unwrap(), 0);
    assert!(wire.is_empty());
    assert!(pool.has_pending());
}
