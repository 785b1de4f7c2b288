//! Coordinator: owner of the connection pool and the stream API.
//!
//! One task runs per authenticated connection. Its read half lands inbound
//! frames while its write half flushes whatever the pool hands it when the
//! wake handle fires; the two never wait on each other. All shared
//! state sits in one [`ConnectionPool`] behind a `std::sync::Mutex` that is
//! only held for synchronous sections, never across an `.await`.

use crate::config::TunnelConfig;
use crate::core::codec::FrameCodec;
use crate::core::frame::{Frame, StreamId};
use crate::core::token::{Obfuscation, TokenGenerator};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::HandshakeEngine;
use crate::protocol::pool::{ConnectionPool, ConnectionRecord, InboundAction, SlotStats};
use crate::service::scheduler::RequestScheduler;
use crate::transport::dns::CovertChannel;
use crate::transport::pluggable::{PluggableTransport, PortMapper};
use crate::transport::{tcp, TransportStream};
use crate::utils::crypto::{fingerprint, SessionSecret};
use crate::utils::metrics::global_metrics;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// Ports tried by [`Coordinator::expose_port`] before giving up
pub const MAX_PORT_ATTEMPTS: usize = 8;

#[derive(Debug)]
pub struct Coordinator {
    pool: Mutex<ConnectionPool>,
    engine: HandshakeEngine,
    inbound: Notify,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(pool: ConnectionPool, engine: HandshakeEngine) -> Self {
        Self {
            pool: Mutex::new(pool),
            engine,
            inbound: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build from configuration with a freshly generated session secret
    pub fn from_config(config: &TunnelConfig) -> Result<Self> {
        let listener = &config.listener;
        let engine = HandshakeEngine::new(
            config.keys.local_secret()?,
            config.keys.remote_public()?,
            SessionSecret::generate(),
        )
        .with_timeout(listener.handshake_timeout)
        .with_initial_delay(listener.handshake_initial_delay)
        .with_max_empty_reads(listener.max_empty_reads);

        let pool = ConnectionPool::with_swapcount(
            config.coordinator.req_num,
            config.coordinator.swapcount,
        );
        Ok(Self::new(pool, engine))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ConnectionPool>> {
        self.pool
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
    }

    pub fn session_secret(&self) -> &SessionSecret {
        self.engine.secret()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every connection task and the scheduler
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Receiver for the "pool has room" signal
    pub fn room(&self) -> Result<watch::Receiver<bool>> {
        Ok(self.lock()?.subscribe_room())
    }

    pub fn snapshot(&self) -> Result<Vec<SlotStats>> {
        Ok(self.lock()?.selection_snapshot())
    }

    pub fn live_connections(&self) -> Result<usize> {
        Ok(self.lock()?.live_count())
    }

    /// Admit a new logical stream
    pub fn register_stream(&self) -> Result<StreamId> {
        self.lock()?.register_stream()
    }

    /// Close a stream; false if it was not active
    pub fn remove_stream(&self, id: StreamId) -> Result<bool> {
        Ok(self.lock()?.remove_stream(id))
    }

    /// Queue bytes for a stream and wake the preferred connection
    pub fn send(&self, id: StreamId, bytes: &[u8]) -> Result<()> {
        self.lock()?.enqueue(id, bytes)
    }

    /// In-order payloads that have arrived for `id`, without waiting
    pub fn try_recv(&self, id: StreamId) -> Result<Vec<Bytes>> {
        let mut pool = self.lock()?;
        if !pool.streams().contains(id) {
            return Err(ProtocolError::UnknownStream(id.to_string()));
        }
        Ok(pool.drain_inbound(id))
    }

    /// Wait until in-order payloads are available for `id`.
    ///
    /// Fails with `UnknownStream` once the stream is closed.
    pub async fn recv(&self, id: StreamId) -> Result<Vec<Bytes>> {
        loop {
            let notified = self.inbound.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = self.try_recv(id)?;
            if !ready.is_empty() {
                return Ok(ready);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return Err(ProtocolError::ConnectionClosed),
            }
        }
    }

    /// Map the listener port through the collaborator.
    ///
    /// A conflict moves on to the next port, up to [`MAX_PORT_ATTEMPTS`] tries.
    /// Any other failure, or running out of attempts, keeps `port`.
    pub async fn expose_port(&self, mapper: &dyn PortMapper, port: u16) -> u16 {
        let mut candidate = port;
        for _ in 0..MAX_PORT_ATTEMPTS {
            match mapper.expose(candidate).await {
                Ok(mapped) => {
                    if mapped != port {
                        info!(port, mapped, "Adopted mapped port");
                    }
                    return mapped;
                }
                Err(ProtocolError::PortConflict(taken)) => match taken.checked_add(1) {
                    Some(next) => {
                        debug!(taken, next, "Port mapping conflict, trying next port");
                        candidate = next;
                    }
                    None => break,
                },
                Err(e) => {
                    warn!(port, error = %e, "Port mapping failed, keeping local port");
                    return port;
                }
            }
        }
        warn!(port, "No free port to map, keeping local port");
        port
    }

    /// Authenticate `stream`, join the pool and pump frames until it ends.
    ///
    /// Handshake failures and a full pool return an error and drop the socket.
    #[instrument(skip(self, stream))]
    pub async fn serve_connection<S: TransportStream>(
        &self,
        mut stream: S,
        peer: Option<SocketAddr>,
    ) -> Result<()> {
        let auth = self.engine.authenticate(&mut stream).await?;

        let wake = Arc::new(Notify::new());
        let mut record = ConnectionRecord::new(wake.clone());
        if let Some(peer) = peer {
            record = record.with_peer(peer);
        }
        let slot = self.lock()?.register(record)?;
        info!(slot, "Connection joined pool");

        let result = self.pump(slot, stream, auth.codec, auth.leftover, &wake).await;

        if let Ok(mut pool) = self.lock() {
            pool.unregister(slot);
        }
        self.inbound.notify_waiters();
        match &result {
            Ok(()) => info!(slot, "Connection left pool"),
            Err(e) => warn!(slot, error = %e, "Connection ended with error"),
        }
        result
    }

    async fn pump<S: TransportStream>(
        &self,
        slot: usize,
        stream: S,
        codec: FrameCodec,
        leftover: BytesMut,
        wake: &Notify,
    ) -> Result<()> {
        let (rd, wr) = tokio::io::split(stream);
        let write_codec = codec.clone();
        let mut reader = FramedRead::new(rd, codec);
        reader.read_buffer_mut().extend_from_slice(&leftover);

        // pick up work queued before this connection registered
        wake.notify_one();

        // both halves are polled together so a slow peer reader never stalls inbound frames
        tokio::select! {
            result = self.read_half(slot, &mut reader) => result,
            result = self.write_half(slot, wr, write_codec, wake) => result,
        }
    }

    async fn read_half<R>(
        &self,
        slot: usize,
        reader: &mut FramedRead<R, FrameCodec>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        while let Some(next) = reader.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e),
            };
            let action = self.lock()?.handle_inbound(slot, frame);
            match action {
                InboundAction::Landed { .. } | InboundAction::StreamClosed(_) => {
                    self.inbound.notify_waiters();
                }
                InboundAction::Dropped => {}
                InboundAction::CloseConnection => return Ok(()),
            }
        }
        debug!(slot, "Peer closed socket");
        Ok(())
    }

    async fn write_half<W>(
        &self,
        slot: usize,
        mut wr: W,
        mut codec: FrameCodec,
        wake: &Notify,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut out = BytesMut::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    out.clear();
                    codec.encode(Frame::CloseConnection, &mut out)?;
                    wr.write_all(&out).await?;
                    wr.shutdown().await.ok();
                    return Ok(());
                }
                _ = wake.notified() => {}
            }

            out.clear();
            let frames = self.lock()?.write_cycle(slot, &mut codec, &mut out)?;
            if frames > 0 {
                wr.write_all(&out).await?;
                debug!(slot, frames, bytes = out.len(), "Write cycle flushed");
            }
        }
    }

    /// Accept and serve connections until shutdown
    pub async fn run_listener(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown_timeout: Duration,
    ) -> Result<()> {
        let coordinator = self.clone();
        tcp::serve(
            listener,
            self.shutdown.clone(),
            shutdown_timeout,
            move |stream, peer| {
                let coordinator = coordinator.clone();
                async move {
                    let _ = stream.set_nodelay(true);
                    if let Err(e) = coordinator.serve_connection(stream, Some(peer)).await {
                        debug!(%peer, error = %e, "Connection closed");
                    }
                }
            },
        )
        .await
    }

    /// Token generator describing this coordinator
    pub fn token_generator(
        &self,
        config: &TunnelConfig,
        local_secret: &StaticSecret,
        remote_port: u16,
        certificate: Option<String>,
    ) -> Result<TokenGenerator> {
        let coordinator = &config.coordinator;
        let ip: IpAddr = coordinator.requester_ip.parse().map_err(|_| {
            ProtocolError::ConfigError(format!("Invalid requester IP: {}", coordinator.requester_ip))
        })?;

        let obfuscation = match coordinator.obfs_level {
            0 => Obfuscation::None,
            1 | 2 => {
                let cert = certificate
                    .or_else(|| coordinator.certificate.clone())
                    .ok_or_else(|| {
                        ProtocolError::ConfigError(constants::ERR_TOKEN_CERTIFICATE.into())
                    })?;
                Obfuscation::Certificate(cert.into_bytes())
            }
            _ => Obfuscation::Padding,
        };

        Ok(TokenGenerator {
            requested: coordinator.req_num,
            remote_port,
            public_fingerprint: fingerprint(PublicKey::from(local_secret).as_bytes()),
            private_fingerprint: fingerprint(&local_secret.to_bytes()),
            ip,
            obfuscation,
            mode: coordinator.mode,
            secret: self.session_secret().clone(),
        })
    }

    /// Bring the whole coordinator up and run until shutdown.
    ///
    /// Binds the listener, starts the transport, maps the port, then runs the
    /// request scheduler and the accept loop side by side.
    pub async fn run(
        self: Arc<Self>,
        config: TunnelConfig,
        channel: Arc<dyn CovertChannel>,
        transport: &dyn PluggableTransport,
        mapper: &dyn PortMapper,
    ) -> Result<()> {
        config.validate_strict()?;
        let local_secret = config.keys.local_secret()?;

        let listener = tcp::bind(config.effective_listen_address()).await?;
        let local = listener.local_addr()?;
        let handle = transport.start(local).await?;
        let port = self.expose_port(mapper, handle.listen_addr.port()).await;

        let generator =
            self.token_generator(&config, &local_secret, port, handle.certificate.clone())?;
        let scheduler =
            RequestScheduler::from_config(&config.coordinator, generator, channel, self.room()?)?;
        let scheduler_task = tokio::spawn(scheduler.run(self.shutdown_token()));

        tcp::shutdown_on_ctrl_c(self.shutdown_token());
        info!(%local, port, "Coordinator running");
        let result = self
            .clone()
            .run_listener(listener, config.listener.shutdown_timeout)
            .await;

        self.shutdown();
        if let Err(e) = scheduler_task.await {
            warn!(error = %e, "Scheduler task failed");
        }
        if let Err(e) = transport.stop().await {
            warn!(error = %e, "Transport stop failed");
        }
        global_metrics().log_metrics();
        result
    }
}
