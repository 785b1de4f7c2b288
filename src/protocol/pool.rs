//! Fixed-capacity pool of authenticated connections.
//!
//! The pool owns the slot array, the preferred-connection pointer, the
//! pool-wide [`StreamTable`] and the queue of pending control frames. At most
//! one connection is preferred at a time and only the preferred connection
//! writes; every other connection just reads.
//!
//! Selection is weighted random over live, non-closing slots with weight
//! `1 / (1 + latency^2)`. The chosen connection's score is then penalised by
//! [`LATENCY_PENALTY`] so the writer keeps rotating under load.
//!
//! The "pool has room" watch signal is `true` exactly when some slot is empty;
//! the request scheduler only emits tokens while it is `true`.

use crate::core::codec::FrameCodec;
use crate::core::frame::{Frame, StreamId};
use crate::error::{ProtocolError, Result};
use crate::protocol::stream_table::StreamTable;
use crate::utils::metrics::global_metrics;
use bytes::{Bytes, BytesMut};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio_util::codec::Encoder;
use tracing::{debug, instrument, trace, warn};

/// Added to the selected connection's latency score after every selection
pub const LATENCY_PENALTY: f64 = 100.0;

/// Streams serviced per write cycle
pub const DEFAULT_SWAPCOUNT: usize = 5;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Selection weight for a latency score
pub fn selection_weight(latency: f64) -> f64 {
    1.0 / (1.0 + latency * latency)
}

/// Index drawn with probability proportional to `weights[i]`
pub fn weighted_pick<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || total.is_nan() || total <= 0.0 {
        return None;
    }
    let mut target = rng.random::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if target < *w {
            return Some(i);
        }
        target -= w;
    }
    // float rounding can leave target a hair above the last weight
    Some(weights.len() - 1)
}

/// Protocol state for one authenticated connection.
///
/// The socket and codec stay with the connection's task; the pool only keeps
/// what selection and wake-up need.
#[derive(Debug)]
pub struct ConnectionRecord {
    slot: usize,
    preferred: bool,
    closing: bool,
    latency: f64,
    wake: Arc<Notify>,
    peer: Option<SocketAddr>,
}

impl ConnectionRecord {
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            slot: 0,
            preferred: false,
            closing: false,
            latency: 0.0,
            wake,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_latency(mut self, latency: f64) -> Self {
        self.latency = latency;
        self
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_preferred(&self) -> bool {
        self.preferred
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    fn is_selectable(&self) -> bool {
        !self.closing && self.latency.is_finite()
    }
}

/// Read-only view of one occupied slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStats {
    pub slot: usize,
    pub latency: f64,
    pub preferred: bool,
    pub closing: bool,
    pub peer: Option<SocketAddr>,
}

/// What the read pump should do after an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    /// Payload stored for the stream
    Landed { id: StreamId, seq: u16 },
    /// Frame for an unknown stream or a duplicate sequence
    Dropped,
    /// Peer closed the stream; its state is gone
    StreamClosed(StreamId),
    /// Peer is closing this connection
    CloseConnection,
}

pub struct ConnectionPool {
    slots: Vec<Option<ConnectionRecord>>,
    preferred: Option<usize>,
    streams: StreamTable,
    control: VecDeque<Frame>,
    swapcount: usize,
    cursor: Option<StreamId>,
    room: watch::Sender<bool>,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self::with_swapcount(capacity, DEFAULT_SWAPCOUNT)
    }

    pub fn with_swapcount(capacity: usize, swapcount: usize) -> Self {
        let capacity = capacity.max(1);
        let (room, _) = watch::channel(true);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            preferred: None,
            streams: StreamTable::new(),
            control: VecDeque::new(),
            swapcount: swapcount.max(1),
            cursor: None,
            room,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_room(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Connections that can still be selected
    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().filter(|r| r.is_selectable()).count()
    }

    pub fn preferred(&self) -> Option<usize> {
        self.preferred
    }

    pub fn get(&self, slot: usize) -> Option<&ConnectionRecord> {
        self.slots.get(slot)?.as_ref()
    }

    /// Receiver for the "pool has room" signal
    pub fn subscribe_room(&self) -> watch::Receiver<bool> {
        self.room.subscribe()
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut StreamTable {
        &mut self.streams
    }

    /// Insert into the first empty slot and re-run selection
    #[instrument(skip(self, record))]
    pub fn register(&mut self, mut record: ConnectionRecord) -> Result<usize> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ProtocolError::PoolFull)?;

        record.slot = slot;
        record.preferred = false;
        self.slots[slot] = Some(record);
        if self.preferred.is_none() {
            self.set_preferred(Some(slot));
        }
        self.select();
        self.update_room();

        global_metrics().connection_registered();
        debug!(slot, live = self.live_count(), "Connection registered");
        Ok(slot)
    }

    /// Clear a slot; re-select if it held the preferred connection
    #[instrument(skip(self))]
    pub fn unregister(&mut self, slot: usize) -> Option<ConnectionRecord> {
        let record = self.slots.get_mut(slot)?.take()?;
        if self.preferred == Some(slot) {
            self.preferred = None;
            self.select();
        }
        self.update_room();

        global_metrics().connection_unregistered();
        debug!(slot, live = self.live_count(), "Connection unregistered");
        Some(record)
    }

    /// Take a connection out of selection ahead of its removal
    pub fn mark_closing(&mut self, slot: usize) {
        let Some(record) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };
        record.closing = true;
        if self.preferred == Some(slot) {
            self.select();
        }
    }

    pub fn set_latency(&mut self, slot: usize, latency: f64) {
        if let Some(record) = self.slots.get_mut(slot).and_then(Option::as_mut) {
            record.latency = latency;
        }
    }

    /// Pick a new preferred connection using the thread RNG
    pub fn select(&mut self) -> Option<usize> {
        self.select_with(&mut rand::rng())
    }

    /// Weighted selection with an explicit RNG
    pub fn select_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        self.set_preferred(None);

        let candidates: Vec<usize> = self
            .slots
            .iter()
            .flatten()
            .filter(|r| r.is_selectable())
            .map(|r| r.slot)
            .collect();
        let weights: Vec<f64> = candidates
            .iter()
            .filter_map(|&i| self.get(i))
            .map(|r| selection_weight(r.latency))
            .collect();

        let chosen = weighted_pick(&weights, rng).map(|i| candidates[i]);
        if let Some(slot) = chosen {
            if let Some(record) = self.slots[slot].as_mut() {
                record.latency += LATENCY_PENALTY;
            }
        }
        self.set_preferred(chosen);
        trace!(preferred = ?chosen, "Selected preferred connection");
        self.wake_if_pending();
        chosen
    }

    fn set_preferred(&mut self, slot: Option<usize>) {
        if let Some(prev) = self.preferred.take() {
            if let Some(record) = self.slots[prev].as_mut() {
                record.preferred = false;
            }
        }
        if let Some(next) = slot {
            if let Some(record) = self.slots[next].as_mut() {
                record.preferred = true;
                self.preferred = Some(next);
            }
        }
    }

    fn update_room(&self) {
        self.room.send_replace(self.has_room());
    }

    /// Control frames or stream bytes waiting to be written
    pub fn has_pending(&self) -> bool {
        !self.control.is_empty() || self.streams.has_pending()
    }

    fn wake_if_pending(&self) {
        if !self.has_pending() {
            return;
        }
        if let Some(record) = self.preferred.and_then(|p| self.get(p)) {
            record.wake.notify_one();
        }
    }

    /// One write-ready event for `slot`.
    ///
    /// Does nothing unless `slot` is preferred. Otherwise writes every queued
    /// control frame, then one frame each for up to `swapcount` streams with
    /// pending bytes, then re-runs selection. Returns the number of frames
    /// written into `dst`.
    #[instrument(skip(self, codec, dst))]
    pub fn write_cycle(
        &mut self,
        slot: usize,
        codec: &mut FrameCodec,
        dst: &mut BytesMut,
    ) -> Result<usize> {
        if self.preferred != Some(slot) {
            return Ok(0);
        }

        let metrics = global_metrics();
        let mut frames = 0;
        while let Some(frame) = self.control.pop_front() {
            codec.encode(frame, dst)?;
            metrics.frame_sent(0);
            frames += 1;
        }

        let ids = self.streams.pending_ids_from(self.cursor);
        for id in ids.into_iter().take(self.swapcount) {
            let Some(state) = self.streams.get(id) else {
                continue;
            };
            let seq = state.out_seq();
            let consumed = codec.encode_chunk(id, seq, state.pending(), dst)?;
            self.streams.dequeue_consumed(id, consumed);
            self.cursor = Some(id);
            metrics.frame_sent(consumed as u64);
            trace!(stream = %id, seq, bytes = consumed, "Frame queued for write");
            frames += 1;
        }

        if frames > 0 {
            self.select();
        }
        Ok(frames)
    }

    /// Allocate a fresh stream id.
    ///
    /// Fails with `PoolExhausted` when no connection could carry the stream.
    #[instrument(skip(self))]
    pub fn register_stream(&mut self) -> Result<StreamId> {
        if self.live_count() == 0 {
            return Err(ProtocolError::PoolExhausted);
        }

        let mut rng = rand::rng();
        let mut candidates: Vec<[u8; 2]> = ID_ALPHABET
            .iter()
            .flat_map(|&a| ID_ALPHABET.iter().map(move |&b| [a, b]))
            .collect();
        candidates.shuffle(&mut rng);

        for pair in candidates {
            let id = StreamId::new(pair)?;
            if !id.is_reserved() && self.streams.open(id) {
                global_metrics().stream_opened();
                debug!(stream = %id, "Stream registered");
                return Ok(id);
            }
        }
        Err(ProtocolError::Custom("All stream ids are in use".into()))
    }

    /// Queue outbound bytes for a registered stream
    pub fn enqueue(&mut self, id: StreamId, bytes: &[u8]) -> Result<()> {
        if !self.streams.is_open(id) {
            return Err(ProtocolError::UnknownStream(id.to_string()));
        }
        self.streams.enqueue_outbound(id, bytes);
        self.wake_if_pending();
        Ok(())
    }

    /// Drop a stream, telling the peer if a connection can carry the notice.
    ///
    /// Returns false if the stream was not active; a second call is a no-op.
    #[instrument(skip(self))]
    pub fn remove_stream(&mut self, id: StreamId) -> bool {
        if !self.streams.contains(id) {
            return false;
        }
        // a stream the peer already closed needs no notice
        let open = self.streams.is_open(id);
        if open && self.live_count() > 0 {
            self.control.push_back(Frame::CloseStream { id });
        } else if open {
            debug!(stream = %id, "No live connection for close notice");
        }
        self.streams.close(id);
        if self.cursor == Some(id) {
            self.cursor = None;
        }
        if open {
            global_metrics().stream_closed();
        }
        self.wake_if_pending();
        true
    }

    /// Apply a frame read from `slot`
    pub fn handle_inbound(&mut self, slot: usize, frame: Frame) -> InboundAction {
        let metrics = global_metrics();
        match frame {
            Frame::Data { id, seq, payload } => {
                let len = payload.len() as u64;
                if self.streams.land_inbound(id, seq, payload) {
                    metrics.frame_received(len);
                    InboundAction::Landed { id, seq }
                } else {
                    warn!(slot, stream = %id, seq, "Dropping frame for unknown stream or duplicate sequence");
                    metrics.frame_dropped();
                    InboundAction::Dropped
                }
            }
            Frame::CloseStream { id } => {
                metrics.frame_received(0);
                if self.streams.close_by_peer(id) {
                    metrics.stream_closed();
                    debug!(
                        slot,
                        stream = %id,
                        buffered = self.streams.contains(id),
                        "Peer closed stream"
                    );
                }
                InboundAction::StreamClosed(id)
            }
            Frame::CloseConnection => {
                metrics.frame_received(0);
                debug!(slot, "Peer is closing connection");
                self.mark_closing(slot);
                InboundAction::CloseConnection
            }
        }
    }

    /// In-order inbound payloads for a stream.
    ///
    /// After a peer close this hands out what is left and forgets the stream.
    pub fn drain_inbound(&mut self, id: StreamId) -> Vec<Bytes> {
        self.streams.drain_in_order(id)
    }

    /// Snapshot of occupied slots for diagnostics
    pub fn selection_snapshot(&self) -> Vec<SlotStats> {
        self.slots
            .iter()
            .flatten()
            .map(|r| SlotStats {
                slot: r.slot,
                latency: r.latency,
                preferred: r.preferred,
                closing: r.closing,
                peer: r.peer,
            })
            .collect()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity())
            .field("occupied", &self.len())
            .field("preferred", &self.preferred)
            .field("streams", &self.streams.len())
            .field("control", &self.control.len())
            .finish()
    }
}
