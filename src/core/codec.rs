//! Encrypted, delimiter-separated frame codec.
//!
//! Each plaintext [`Frame`] is sealed with the connection's cipher, armoured
//! as standard base64 and terminated by a 7-byte delimiter:
//!
//! ```text
//! base64(nonce(24) || XChaCha20-Poly1305(frame)) || 1B 1C H H H H 1F
//! ```
//!
//! The four `H` bytes are the uppercase hex of the second-to-last and
//! third-to-last session secret bytes. The base64 alphabet contains no control
//! characters, so a delimiter can never occur inside a segment.
//!
//! Undecodable segments are logged and skipped; they never end the stream.

use crate::core::frame::{Frame, StreamId, CLOSE_MARKER, HEADER_LEN, SEG_SIZE};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{Crypto, SessionSecret, NONCE_LEN, TAG_LEN};
use crate::utils::metrics::global_metrics;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Delimiter length in bytes
pub const DELIMITER_LEN: usize = 7;

/// Longest armoured segment a well-behaved peer can produce
pub const MAX_WIRE_SEGMENT: usize = (NONCE_LEN + HEADER_LEN + SEG_SIZE + TAG_LEN).div_ceil(3) * 4;

/// Frame separator derived from the session secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiter([u8; DELIMITER_LEN]);

impl Delimiter {
    pub fn from_secret(secret: &SessionSecret) -> Self {
        let s = secret.as_bytes();
        let hex = format!("{:02X}{:02X}", s[s.len() - 2], s[s.len() - 3]);
        let h = hex.as_bytes();
        Self([0x1B, 0x1C, h[0], h[1], h[2], h[3], 0x1F])
    }

    pub fn as_bytes(&self) -> &[u8; DELIMITER_LEN] {
        &self.0
    }
}

/// Frame codec bound to one authenticated connection
#[derive(Debug, Clone)]
pub struct FrameCodec {
    crypto: Crypto,
    delimiter: Delimiter,
}

impl FrameCodec {
    pub fn new(session_key: &[u8; 32], secret: &SessionSecret) -> Self {
        Self {
            crypto: Crypto::new(session_key),
            delimiter: Delimiter::from_secret(secret),
        }
    }

    pub fn delimiter(&self) -> &Delimiter {
        &self.delimiter
    }

    /// Emit one data frame carrying at most `SEG_SIZE` bytes from the head of
    /// `queued`, returning how many bytes were consumed.
    ///
    /// A chunk that would be byte-identical to the close marker is shortened by
    /// one byte; the remainder goes out in the next frame.
    pub fn encode_chunk(
        &mut self,
        id: StreamId,
        seq: u16,
        queued: &[u8],
        dst: &mut BytesMut,
    ) -> Result<usize> {
        let mut take = queued.len().min(SEG_SIZE);
        if &queued[..take] == CLOSE_MARKER {
            take -= 1;
        }
        let frame = Frame::Data {
            id,
            seq,
            payload: Bytes::copy_from_slice(&queued[..take]),
        };
        self.encode(frame, dst)?;
        Ok(take)
    }

    fn decode_segment(&self, segment: &[u8]) -> Result<Frame> {
        let sealed = STANDARD
            .decode(segment)
            .map_err(|_| ProtocolError::FrameDecode(constants::ERR_FRAME_BASE64.into()))?;
        let plain = self
            .crypto
            .open(&sealed)
            .map_err(|e| ProtocolError::FrameDecode(e.to_string()))?;
        Frame::parse_plain(&plain)
    }

    fn find_delimiter(&self, src: &[u8]) -> Option<usize> {
        src.windows(DELIMITER_LEN)
            .position(|w| w == self.delimiter.as_bytes())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            let Some(pos) = self.find_delimiter(src) else {
                if src.len() > MAX_WIRE_SEGMENT + DELIMITER_LEN {
                    warn!(buffered = src.len(), "Discarding oversized unterminated segment");
                    global_metrics().frame_dropped();
                    src.clear();
                }
                return Ok(None);
            };

            let segment = src.split_to(pos);
            src.advance(DELIMITER_LEN);

            match self.decode_segment(&segment) {
                Ok(frame) => {
                    trace!(len = segment.len(), "Decoded frame segment");
                    return Ok(Some(frame));
                }
                Err(e) => {
                    warn!(error = %e, len = segment.len(), "Dropping undecodable frame");
                    global_metrics().frame_dropped();
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let frame = self.decode(src)?;
        if frame.is_none() && !src.is_empty() {
            trace!(buffered = src.len(), "Discarding unterminated tail at end of stream");
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let mut plain = Vec::with_capacity(HEADER_LEN + frame.payload_len());
        frame.write_plain(&mut plain)?;
        let sealed = self.crypto.seal(&plain)?;
        let armoured = STANDARD.encode(sealed);

        dst.reserve(armoured.len() + DELIMITER_LEN);
        dst.extend_from_slice(armoured.as_bytes());
        dst.extend_from_slice(self.delimiter.as_bytes());
        Ok(())
    }
}
