//! Plaintext frame layout.
//!
//! ```text
//! [stream id (2 ASCII)] [sequence (3 ASCII digits, zero-padded)] [payload (0..=SEG_SIZE)]
//! ```
//!
//! The reserved id `"00"` is never a logical stream. A frame whose payload is
//! exactly [`CLOSE_MARKER`] is a control frame: on `"00"` it closes the
//! physical connection, on any other id it closes that stream.

use crate::error::{constants, ProtocolError, Result};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Maximum payload bytes per frame
pub const SEG_SIZE: usize = 4084;

/// Width of the sequence field
pub const SEQ_WIDTH: usize = 3;

/// Sequence numbers wrap at this value
pub const SEQ_MODULUS: u16 = 1000;

/// Bytes before the payload
pub const HEADER_LEN: usize = 2 + SEQ_WIDTH;

/// Payload signalling a close
pub const CLOSE_MARKER: &[u8; 5] = b"\x04\x04\x04\x04\x04";

/// Two-character logical stream identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId([u8; 2]);

impl StreamId {
    /// Pool-level control id, never assigned to a logical stream
    pub const RESERVED: StreamId = StreamId(*b"00");

    pub fn new(bytes: [u8; 2]) -> Result<Self> {
        if bytes.iter().all(u8::is_ascii_alphanumeric) {
            Ok(Self(bytes))
        } else {
            Err(ProtocolError::FrameDecode(constants::ERR_FRAME_STREAM_ID.into()))
        }
    }

    pub fn is_reserved(&self) -> bool {
        *self == Self::RESERVED
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // constructor admits ASCII only
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.as_str())
    }
}

impl FromStr for StreamId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; 2] = s
            .as_bytes()
            .try_into()
            .map_err(|_| ProtocolError::FrameDecode(constants::ERR_FRAME_STREAM_ID.into()))?;
        Self::new(bytes)
    }
}

/// Advance a sequence number, wrapping after 999
pub fn next_seq(seq: u16) -> u16 {
    (seq + 1) % SEQ_MODULUS
}

/// One decoded unit of the tunnel protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload chunk for a logical stream
    Data {
        id: StreamId,
        seq: u16,
        payload: Bytes,
    },
    /// Peer closed a logical stream
    CloseStream { id: StreamId },
    /// Peer is closing the physical connection
    CloseConnection,
}

impl Frame {
    /// Payload bytes carried, zero for control frames
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Data { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    /// Append the plaintext form of this frame to `dst`
    pub fn write_plain(&self, dst: &mut Vec<u8>) -> Result<()> {
        match self {
            Frame::Data { id, seq, payload } => {
                if id.is_reserved() {
                    return Err(ProtocolError::FrameDecode(constants::ERR_FRAME_RESERVED.into()));
                }
                if payload.len() > SEG_SIZE {
                    return Err(ProtocolError::FrameDecode(constants::ERR_FRAME_OVERSIZED.into()));
                }
                if &payload[..] == CLOSE_MARKER {
                    return Err(ProtocolError::FrameDecode(
                        "Data payload collides with the close marker".into(),
                    ));
                }
                write_header(dst, id, *seq);
                dst.extend_from_slice(payload);
            }
            Frame::CloseStream { id } => {
                write_header(dst, id, 0);
                dst.extend_from_slice(CLOSE_MARKER);
            }
            Frame::CloseConnection => {
                write_header(dst, &StreamId::RESERVED, 0);
                dst.extend_from_slice(CLOSE_MARKER);
            }
        }
        Ok(())
    }

    /// Parse a decrypted frame
    pub fn parse_plain(plain: &[u8]) -> Result<Frame> {
        if plain.len() < HEADER_LEN {
            return Err(ProtocolError::FrameDecode(constants::ERR_FRAME_TOO_SHORT.into()));
        }
        let id = StreamId::new([plain[0], plain[1]])?;
        let seq = parse_seq(&plain[2..HEADER_LEN])?;
        let payload = &plain[HEADER_LEN..];

        if payload == CLOSE_MARKER {
            return Ok(if id.is_reserved() {
                Frame::CloseConnection
            } else {
                Frame::CloseStream { id }
            });
        }
        if id.is_reserved() {
            return Err(ProtocolError::FrameDecode(constants::ERR_FRAME_RESERVED.into()));
        }
        if payload.len() > SEG_SIZE {
            return Err(ProtocolError::FrameDecode(constants::ERR_FRAME_OVERSIZED.into()));
        }
        Ok(Frame::Data {
            id,
            seq,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn write_header(dst: &mut Vec<u8>, id: &StreamId, seq: u16) {
    dst.extend_from_slice(id.as_bytes());
    dst.extend_from_slice(format!("{:03}", seq % SEQ_MODULUS).as_bytes());
}

fn parse_seq(field: &[u8]) -> Result<u16> {
    if field.len() != SEQ_WIDTH || !field.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::FrameDecode(constants::ERR_FRAME_SEQUENCE.into()));
    }
    Ok(field
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
}
