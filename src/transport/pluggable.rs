//! Boundaries to the obfuscation layer and the port-mapping collaborator.
//!
//! A pluggable transport is a black box: once started it fronts the listener
//! and delivers plain byte streams to it. The coordinator only signals start
//! and stop.

use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::debug;

/// What a started transport exposes to the rest of the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    /// Address remote peers should reach
    pub listen_addr: SocketAddr,
    /// Certificate the remote side needs, if the layer uses one
    pub certificate: Option<String>,
}

#[async_trait]
pub trait PluggableTransport: Send + Sync {
    /// Start fronting `target`, the coordinator's local listener
    async fn start(&self, target: SocketAddr) -> Result<TransportHandle>;

    async fn stop(&self) -> Result<()>;
}

/// No obfuscation: peers reach the listener directly
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTransport;

#[async_trait]
impl PluggableTransport for DirectTransport {
    async fn start(&self, target: SocketAddr) -> Result<TransportHandle> {
        debug!(%target, "Direct transport, nothing to start");
        Ok(TransportHandle {
            listen_addr: target,
            certificate: None,
        })
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Exposes the coordinator's port to the outside world
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Map `port`, returning the externally visible port.
    ///
    /// A port already mapped by someone else is reported as
    /// `ProtocolError::PortConflict` carrying that port, so the caller can try the next one.
    async fn expose(&self, port: u16) -> Result<u16>;
}

/// Port is already reachable; nothing to map
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPortMapping;

#[async_trait]
impl PortMapper for NoPortMapping {
    async fn expose(&self, port: u16) -> Result<u16> {
        Ok(port)
    }
}
