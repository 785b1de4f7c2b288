//! Remote end of a physical connection.
//!
//! The remote side learns the coordinator's address, port and session secret
//! from a request token, dials back, sends the authentication blob and then
//! exchanges frames with the same codec the coordinator uses.

use crate::core::codec::FrameCodec;
use crate::core::frame::{next_seq, Frame, StreamId};
use crate::core::token::RequestToken;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::build_auth_blob;
use crate::transport::TransportStream;
use crate::utils::crypto::SessionSecret;
use bytes::{Bytes, BytesMut};
use ed25519_dalek::SigningKey;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, instrument};
use x25519_dalek::PublicKey;

pub struct RemoteLink<S> {
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    writer: WriteHalf<S>,
    codec: FrameCodec,
    out_seq: HashMap<StreamId, u16>,
    inbound: HashMap<StreamId, InboundStream>,
}

/// Reassembly state for one stream on the remote side
#[derive(Debug, Default)]
struct InboundStream {
    next: u16,
    pending: HashMap<u16, Bytes>,
    buffered: BytesMut,
}

impl RemoteLink<TcpStream> {
    /// Dial `addr` and authenticate
    #[instrument(skip(signing_key, acceptor_public, secret))]
    pub async fn dial(
        addr: SocketAddr,
        signing_key: &SigningKey,
        acceptor_public: &PublicKey,
        secret: &SessionSecret,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::establish(stream, signing_key, acceptor_public, secret).await
    }

    /// Dial back to the coordinator described by a verified token
    pub async fn from_token(
        token: &RequestToken,
        signing_key: &SigningKey,
        acceptor_public: &PublicKey,
    ) -> Result<Self> {
        let addr = SocketAddr::new(token.requester_ip()?, token.remote_port);
        let secret = token.session_secret()?;
        Self::dial(addr, signing_key, acceptor_public, &secret).await
    }
}

impl<S: TransportStream> RemoteLink<S> {
    /// Send the authentication blob over an already-open stream
    pub async fn establish(
        stream: S,
        signing_key: &SigningKey,
        acceptor_public: &PublicKey,
        secret: &SessionSecret,
    ) -> Result<Self> {
        let (blob, session_key) = build_auth_blob(signing_key, acceptor_public, secret)?;
        let codec = FrameCodec::new(&session_key, secret);

        let (rd, mut writer) = tokio::io::split(stream);
        writer.write_all(&blob).await?;
        debug!("Authentication blob sent");

        Ok(Self {
            reader: FramedRead::new(rd, codec.clone()),
            writer,
            codec,
            out_seq: HashMap::new(),
            inbound: HashMap::new(),
        })
    }

    /// Send `data` on a stream, split into as many frames as needed
    pub async fn send_data(&mut self, id: StreamId, mut data: &[u8]) -> Result<usize> {
        let mut out = BytesMut::new();
        let mut frames = 0;
        while !data.is_empty() {
            let seq = self.out_seq.entry(id).or_insert(0);
            let consumed = self.codec.encode_chunk(id, *seq, data, &mut out)?;
            *seq = next_seq(*seq);
            data = &data[consumed..];
            frames += 1;
        }
        self.writer.write_all(&out).await?;
        Ok(frames)
    }

    /// Send a single frame as-is
    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let mut out = BytesMut::new();
        self.codec.encode(frame, &mut out)?;
        self.writer.write_all(&out).await?;
        Ok(())
    }

    pub async fn close_stream(&mut self, id: StreamId) -> Result<()> {
        self.out_seq.remove(&id);
        self.send_frame(Frame::CloseStream { id }).await
    }

    /// Tell the coordinator this connection is going away
    pub async fn close(mut self) -> Result<()> {
        self.send_frame(Frame::CloseConnection).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Next decoded frame, or `None` once the coordinator closes the socket
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        match self.reader.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Collect exactly `len` in-order payload bytes for `id`.
    ///
    /// Frames for other streams are kept for later calls.
    pub async fn recv_exact(&mut self, id: StreamId, len: usize) -> Result<Bytes> {
        loop {
            let ready = self.inbound.entry(id).or_default();
            if ready.buffered.len() >= len {
                return Ok(ready.buffered.split_to(len).freeze());
            }
            match self.recv().await? {
                Some(Frame::Data { id: got, seq, payload }) => {
                    let state = self.inbound.entry(got).or_default();
                    state.pending.insert(seq, payload);
                    while let Some(chunk) = state.pending.remove(&state.next) {
                        state.buffered.extend_from_slice(&chunk);
                        state.next = next_seq(state.next);
                    }
                }
                Some(Frame::CloseStream { id: got }) if got == id => {
                    self.inbound.remove(&id);
                    return Err(ProtocolError::UnknownStream(id.to_string()));
                }
                Some(Frame::CloseStream { id: got }) => {
                    self.inbound.remove(&got);
                }
                Some(Frame::CloseConnection) | None => return Err(ProtocolError::ConnectionClosed),
            }
        }
    }
}

impl<S> std::fmt::Debug for RemoteLink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLink")
            .field("streams", &self.out_seq.len())
            .finish_non_exhaustive()
    }
}
