// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::core::codec::FrameCodec;
use crate::core::frame::{Frame, StreamId, SEG_SIZE};
use crate::error::ProtocolError;
use crate::protocol::pool::*;
use crate::utils::crypto::SessionSecret;
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::codec::Decoder;

fn codec() -> FrameCodec {
    let secret = SessionSecret::from_bytes(b"abcdefghijklmnop").expect("valid secret");
    FrameCodec::new(&[3u8; 32], &secret)
}

fn record(latency: f64) -> ConnectionRecord {
    ConnectionRecord::new(Arc::new(Notify::new())).with_latency(latency)
}

fn pool_with(latencies: &[f64]) -> ConnectionPool {
    let mut pool = ConnectionPool::new(latencies.len());
    for &l in latencies {
        pool.register(record(l)).unwrap();
    }
    pool
}

/// Run write cycles on whichever slot is preferred until nothing is pending
fn drain(pool: &mut ConnectionPool, codec: &mut FrameCodec) -> (usize, BytesMut) {
    let mut wire = BytesMut::new();
    let mut frames = 0;
    while pool.has_pending() {
        let slot = pool.preferred().expect("a preferred connection");
        let written = pool.write_cycle(slot, codec, &mut wire).unwrap();
        assert!(written > 0, "preferred connection made no progress");
        frames += written;
    }
    (frames, wire)
}

#[test]
fn test_scenario_a_large_payload_spans_three_frames() {
    let mut pool = pool_with(&[1.0, 2.0]);
    let a = pool.register_stream().unwrap();
    let b = pool.register_stream().unwrap();
    assert_ne!(a, b);
    assert!(!a.is_reserved() && !b.is_reserved());

    let payload: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
    pool.enqueue(a, &payload).unwrap();

    let mut enc = codec();
    let (frames, mut wire) = drain(&mut pool, &mut enc);
    assert_eq!(frames, 3);

    let mut dec = codec();
    let mut reassembled = Vec::new();
    let mut seqs = Vec::new();
    while let Some(frame) = dec.decode(&mut wire).unwrap() {
        match frame {
            Frame::Data { id, seq, payload } => {
                assert_eq!(id, a);
                assert!(payload.len() <= SEG_SIZE);
                seqs.push(seq);
                reassembled.extend_from_slice(&payload);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(seqs, vec![0, 1, 2]);
    assert_eq!(reassembled, payload);
}

#[test]
fn test_scenario_b_closed_stream_ignores_inbound() {
    let mut pool = pool_with(&[0.0]);
    let id = pool.register_stream().unwrap();
    assert!(pool.remove_stream(id));

    assert!(!pool.streams_mut().land_inbound(id, 0, Bytes::from_static(b"late")));
    assert_eq!(
        pool.handle_inbound(
            0,
            Frame::Data {
                id,
                seq: 1,
                payload: Bytes::from_static(b"late")
            }
        ),
        InboundAction::Dropped
    );

    // id is free again
    assert!(pool.streams_mut().open(id));
}

#[test]
fn test_scenario_c_removed_preferred_never_selected() {
    let mut pool = pool_with(&[0.0, 0.0, 0.0]);
    let removed = pool.preferred().unwrap();
    pool.unregister(removed);

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..500 {
        let chosen = pool.select_with(&mut rng).unwrap();
        assert_ne!(chosen, removed);
    }
    assert_eq!(pool.live_count(), 2);
}

#[test]
fn test_selection_favours_low_latency() {
    let latencies = [0.5, 1.0, 3.0];
    let mut rng = StdRng::seed_from_u64(42);
    let mut pool = pool_with(&latencies);
    let mut counts = [0usize; 3];
    for _ in 0..20_000 {
        // registering already penalised someone; restore the measured latencies
        for (slot, &l) in latencies.iter().enumerate() {
            pool.set_latency(slot, l);
        }
        let chosen = pool.select_with(&mut rng).unwrap();
        assert_eq!(pool.preferred(), Some(chosen));
        assert_eq!(
            pool.get(chosen).unwrap().latency(),
            latencies[chosen] + LATENCY_PENALTY
        );
        counts[chosen] += 1;
    }
    assert!(counts[0] > counts[1]);
    assert!(counts[1] > counts[2]);
    assert!(counts[2] > 0);
}

#[test]
fn test_penalty_rotates_preferred() {
    let mut pool = pool_with(&[0.0, 1.0, 2.0]);
    let mut seen = HashSet::new();
    for _ in 0..30 {
        seen.insert(pool.select().unwrap());
    }
    assert_eq!(seen.len(), 3);
}

#[test]
fn test_exactly_one_preferred() {
    let mut pool = pool_with(&[0.0, 5.0, 9.0]);
    for _ in 0..20 {
        pool.select();
        let preferred: Vec<_> = pool
            .selection_snapshot()
            .into_iter()
            .filter(|s| s.preferred)
            .collect();
        assert_eq!(preferred.len(), 1);
        assert_eq!(Some(preferred[0].slot), pool.preferred());
    }
}

#[test]
fn test_register_stream_never_returns_reserved() {
    let mut pool = pool_with(&[0.0]);
    let mut ids = HashSet::new();
    for _ in 0..1000 {
        let id = pool.register_stream().unwrap();
        assert_ne!(id, StreamId::RESERVED);
        assert!(ids.insert(id), "duplicate id {id}");
    }
}

#[test]
fn test_register_stream_fails_without_connections() {
    let mut pool = ConnectionPool::new(2);
    assert!(matches!(
        pool.register_stream(),
        Err(ProtocolError::PoolExhausted)
    ));
}

#[test]
fn test_remove_stream_twice_sends_one_close() {
    let mut pool = pool_with(&[0.0, 0.0]);
    let id = pool.register_stream().unwrap();

    assert!(pool.remove_stream(id));
    assert!(!pool.remove_stream(id));

    let mut enc = codec();
    let (frames, mut wire) = drain(&mut pool, &mut enc);
    assert_eq!(frames, 1);
    assert_eq!(
        codec().decode(&mut wire).unwrap(),
        Some(Frame::CloseStream { id })
    );
}

#[test]
fn test_remove_stream_without_connections_skips_notice() {
    let mut pool = pool_with(&[0.0]);
    let id = pool.register_stream().unwrap();
    pool.unregister(0);
    assert!(pool.remove_stream(id));
    assert!(!pool.has_pending());
}

#[test]
fn test_full_pool_and_room_signal() {
    let mut pool = ConnectionPool::new(2);
    let room = pool.subscribe_room();
    assert!(*room.borrow());

    pool.register(record(0.0)).unwrap();
    assert!(*room.borrow());
    pool.register(record(0.0)).unwrap();
    assert!(!*room.borrow());
    assert!(matches!(
        pool.register(record(0.0)),
        Err(ProtocolError::PoolFull)
    ));

    pool.unregister(1);
    assert!(*room.borrow());
    assert_eq!(pool.register(record(0.0)).unwrap(), 1);
}

#[test]
fn test_unregister_last_connection_clears_preferred() {
    let mut pool = pool_with(&[0.0]);
    pool.unregister(0);
    assert!(pool.is_empty());
    assert_eq!(pool.preferred(), None);
    assert_eq!(pool.select(), None);
}

#[test]
fn test_non_preferred_slot_writes_nothing() {
    let mut pool = pool_with(&[0.0, 0.0]);
    let id = pool.register_stream().unwrap();
    pool.enqueue(id, b"data").unwrap();

    let other = 1 - pool.preferred().unwrap();
    let mut wire = BytesMut::new();
    assert_eq!(pool.write_cycle(other, &mut codec(), &mut wire).unwrap(), 0);
    assert!(wire.is_empty());
}

#[test]
fn test_swapcount_caps_streams_per_cycle() {
    let mut pool = ConnectionPool::with_swapcount(1, 2);
    pool.register(record(0.0)).unwrap();
    let ids: Vec<_> = (0..4).map(|_| pool.register_stream().unwrap()).collect();
    for id in &ids {
        pool.enqueue(*id, b"x").unwrap();
    }

    let mut enc = codec();
    let mut wire = BytesMut::new();
    assert_eq!(pool.write_cycle(0, &mut enc, &mut wire).unwrap(), 2);
    assert_eq!(pool.write_cycle(0, &mut enc, &mut wire).unwrap(), 2);
    assert!(!pool.has_pending());
}

#[test]
fn test_inbound_close_connection_reselects() {
    let mut pool = pool_with(&[0.0, 0.0]);
    let preferred = pool.preferred().unwrap();
    assert_eq!(
        pool.handle_inbound(preferred, Frame::CloseConnection),
        InboundAction::CloseConnection
    );
    assert!(pool.get(preferred).unwrap().is_closing());
    assert_eq!(pool.preferred(), Some(1 - preferred));
}

#[test]
fn test_inbound_close_stream_removes_state() {
    let mut pool = pool_with(&[0.0]);
    let id = pool.register_stream().unwrap();
    pool.handle_inbound(
        0,
        Frame::Data {
            id,
            seq: 0,
            payload: Bytes::from_static(b"hi"),
        },
    );
    assert_eq!(pool.drain_inbound(id), vec![Bytes::from_static(b"hi")]);

    assert_eq!(
        pool.handle_inbound(0, Frame::CloseStream { id }),
        InboundAction::StreamClosed(id)
    );
    assert!(!pool.streams().contains(id));
}

#[test]
fn test_peer_close_delivers_buffered_data_first() {
    let mut pool = pool_with(&[0.0]);
    let id = pool.register_stream().unwrap();
    pool.enqueue(id, b"reply never sent").unwrap();
    for (seq, chunk) in [(0, "final "), (1, "bytes")] {
        pool.handle_inbound(
            0,
            Frame::Data {
                id,
                seq,
                payload: Bytes::from_static(chunk.as_bytes()),
            },
        );
    }

    assert_eq!(
        pool.handle_inbound(0, Frame::CloseStream { id }),
        InboundAction::StreamClosed(id)
    );
    assert!(pool.streams().contains(id));
    assert!(!pool.has_pending());
    assert!(matches!(
        pool.enqueue(id, b"late"),
        Err(ProtocolError::UnknownStream(_))
    ));

    assert_eq!(
        pool.drain_inbound(id),
        vec![Bytes::from_static(b"final "), Bytes::from_static(b"bytes")]
    );
    assert!(!pool.streams().contains(id));
    assert!(!pool.remove_stream(id));
}

#[test]
fn test_local_remove_after_peer_close_sends_no_notice() {
    let mut pool = pool_with(&[0.0]);
    let id = pool.register_stream().unwrap();
    pool.handle_inbound(
        0,
        Frame::Data {
            id,
            seq: 0,
            payload: Bytes::from_static(b"unread"),
        },
    );
    pool.handle_inbound(0, Frame::CloseStream { id });

    assert!(pool.remove_stream(id));
    assert!(!pool.streams().contains(id));
    assert!(!pool.has_pending());
}
