//! Per-stream state shared by every connection in the pool.
//!
//! The table is pool-wide rather than per-connection, so a stream survives the
//! loss of whichever connection last carried it. It holds no locks of its own;
//! the pool owns it and serialises access.

use crate::core::frame::{next_seq, StreamId};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Outbound queue, sequence counter and inbound reorder map for one stream
#[derive(Debug, Default)]
pub struct StreamState {
    outbound: BytesMut,
    out_seq: u16,
    inbound: BTreeMap<u16, Bytes>,
    next_inbound: u16,
    peer_closed: bool,
}

impl StreamState {
    pub fn pending(&self) -> &[u8] {
        &self.outbound
    }

    pub fn out_seq(&self) -> u16 {
        self.out_seq
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// The peer has closed this stream; only buffered inbound data remains
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }
}

#[derive(Debug, Default)]
pub struct StreamTable {
    streams: BTreeMap<StreamId, StreamState>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty entry; false if the id is reserved or already active
    pub fn open(&mut self, id: StreamId) -> bool {
        if id.is_reserved() || self.streams.contains_key(&id) {
            return false;
        }
        self.streams.insert(id, StreamState::default());
        true
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// Present and not yet closed by the peer
    pub fn is_open(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|s| !s.peer_closed)
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Append to the id's outbound queue, creating the entry on first use.
    /// The reserved id is ignored.
    pub fn enqueue_outbound(&mut self, id: StreamId, bytes: &[u8]) {
        if id.is_reserved() {
            return;
        }
        self.streams
            .entry(id)
            .or_default()
            .outbound
            .extend_from_slice(bytes);
    }

    /// Drop `n` sent bytes from the head of the queue and advance the
    /// outbound sequence. Call once per emitted frame.
    pub fn dequeue_consumed(&mut self, id: StreamId, n: usize) {
        if let Some(state) = self.streams.get_mut(&id) {
            let n = n.min(state.outbound.len());
            state.outbound.advance(n);
            state.out_seq = next_seq(state.out_seq);
        }
    }

    /// Store an inbound payload under its sequence number.
    ///
    /// Returns false (and stores nothing) for unknown ids or a sequence that
    /// is already held.
    pub fn land_inbound(&mut self, id: StreamId, seq: u16, bytes: Bytes) -> bool {
        let Some(state) = self.streams.get_mut(&id) else {
            return false;
        };
        if state.inbound.contains_key(&seq) {
            return false;
        }
        state.inbound.insert(seq, bytes);
        true
    }

    /// Remove one inbound payload by sequence number
    pub fn take_inbound(&mut self, id: StreamId, seq: u16) -> Option<Bytes> {
        self.streams.get_mut(&id)?.inbound.remove(&seq)
    }

    /// Pop consecutive payloads starting at the stream's next expected sequence.
    ///
    /// A stream the peer has closed is removed once this hands out its data.
    pub fn drain_in_order(&mut self, id: StreamId) -> Vec<Bytes> {
        let Some(state) = self.streams.get_mut(&id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(chunk) = state.inbound.remove(&state.next_inbound) {
            out.push(chunk);
            state.next_inbound = next_seq(state.next_inbound);
        }
        if state.peer_closed {
            self.streams.remove(&id);
        }
        out
    }

    /// Ids with queued outbound bytes, in id order starting after `cursor`
    /// and wrapping around.
    pub fn pending_ids_from(&self, cursor: Option<StreamId>) -> Vec<StreamId> {
        let has_pending = |(id, state): (&StreamId, &StreamState)| {
            (!state.outbound.is_empty()).then_some(*id)
        };
        match cursor {
            None => self.streams.iter().filter_map(has_pending).collect(),
            Some(c) => self
                .streams
                .range((Bound::Excluded(c), Bound::Unbounded))
                .chain(self.streams.range(..=c))
                .filter_map(has_pending)
                .collect(),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.streams.values().any(|s| !s.outbound.is_empty())
    }

    /// Record a close sent by the peer.
    ///
    /// Queued outbound bytes are discarded. Inbound payloads not yet drained
    /// stay until [`StreamTable::drain_in_order`] hands them out; with none
    /// buffered the entry goes at once. False for unknown ids or a repeat.
    pub fn close_by_peer(&mut self, id: StreamId) -> bool {
        let Some(state) = self.streams.get_mut(&id) else {
            return false;
        };
        if state.peer_closed {
            return false;
        }
        if state.inbound.is_empty() {
            self.streams.remove(&id);
        } else {
            state.peer_closed = true;
            state.outbound.clear();
        }
        true
    }

    /// Remove all state for `id`. Closing an unknown id is a no-op.
    pub fn close(&mut self, id: StreamId) -> bool {
        self.streams.remove(&id).is_some()
    }
}
