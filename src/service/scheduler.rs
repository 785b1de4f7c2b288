//! Request scheduler.
//!
//! While the pool has an empty slot, emit one fresh request token every
//! interval, rotating through the configured resolvers. When the pool fills
//! the scheduler parks on the room signal and sends nothing; that gate is the
//! only thing limiting covert-channel traffic.

use crate::config::CoordinatorConfig;
use crate::core::token::TokenGenerator;
use crate::error::{ProtocolError, Result};
use crate::transport::dns::CovertChannel;
use crate::utils::metrics::global_metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct RequestScheduler {
    generator: TokenGenerator,
    ctl_domain: String,
    resolvers: Vec<SocketAddr>,
    next_resolver: usize,
    interval: Duration,
    channel: Arc<dyn CovertChannel>,
    room: watch::Receiver<bool>,
}

impl RequestScheduler {
    pub fn new(
        generator: TokenGenerator,
        ctl_domain: impl Into<String>,
        resolvers: Vec<SocketAddr>,
        interval: Duration,
        channel: Arc<dyn CovertChannel>,
        room: watch::Receiver<bool>,
    ) -> Result<Self> {
        if resolvers.is_empty() {
            return Err(ProtocolError::ConfigError(
                "At least one resolver must be configured".into(),
            ));
        }
        Ok(Self {
            generator,
            ctl_domain: ctl_domain.into(),
            resolvers,
            next_resolver: 0,
            interval,
            channel,
            room,
        })
    }

    pub fn from_config(
        config: &CoordinatorConfig,
        generator: TokenGenerator,
        channel: Arc<dyn CovertChannel>,
        room: watch::Receiver<bool>,
    ) -> Result<Self> {
        let resolvers = config
            .resolvers
            .iter()
            .map(|r| {
                r.parse::<SocketAddr>()
                    .map_err(|_| ProtocolError::ConfigError(format!("Invalid resolver: {r}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(
            generator,
            config.ctl_domain.clone(),
            resolvers,
            config.request_interval,
            channel,
            room,
        )
    }

    /// Emit until `shutdown` fires or the pool goes away
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(resolvers = self.resolvers.len(), interval_ms = self.interval.as_millis() as u64, "Request scheduler started");
        loop {
            let has_room = tokio::select! {
                _ = shutdown.cancelled() => break,
                room = self.wait_for_room() => room,
            };
            if !has_room {
                debug!("Pool dropped, scheduler exiting");
                break;
            }

            if let Err(e) = self.emit_once().await {
                warn!(error = %e, "Failed to emit request token");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Request scheduler stopped");
        Ok(())
    }

    /// Resolves true once the pool has room, false if the pool is gone
    async fn wait_for_room(&mut self) -> bool {
        loop {
            if *self.room.borrow_and_update() {
                return true;
            }
            if self.room.changed().await.is_err() {
                return false;
            }
        }
    }

    fn next_resolver(&mut self) -> SocketAddr {
        let resolver = self.resolvers[self.next_resolver % self.resolvers.len()];
        self.next_resolver = (self.next_resolver + 1) % self.resolvers.len();
        resolver
    }

    /// Build one token and send it to the next resolver
    #[instrument(skip(self))]
    pub async fn emit_once(&mut self) -> Result<()> {
        let token = self.generator.generate()?;
        let qname = token.query_name(&self.ctl_domain)?;
        let resolver = self.next_resolver();
        self.channel.emit(resolver, &qname).await?;
        global_metrics().token_emitted();
        debug!(%resolver, "Request token emitted");
        Ok(())
    }
}
