//! DNS covert channel.
//!
//! A request token is signalled by asking a resolver for an `A` record of
//! `<token>.<ctl-domain>`. The query itself is the message; answers are never
//! read.

use crate::error::{ProtocolError, Result};
use async_trait::async_trait;
use rand::Rng;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, instrument};

/// Longest encoded name, including length octets and the root label
pub const MAX_NAME_WIRE_LEN: usize = 255;

const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;

/// Build a single-question `A`/`IN` query for `qname`
pub fn encode_query(id: u16, qname: &str) -> Result<Vec<u8>> {
    let name = qname.trim_end_matches('.');
    let mut packet = Vec::with_capacity(12 + name.len() + 6);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&FLAG_RECURSION_DESIRED.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0u8; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    let name_start = packet.len();
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProtocolError::InvalidToken(format!(
                "DNS label of {} bytes",
                label.len()
            )));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    if packet.len() - name_start > MAX_NAME_WIRE_LEN {
        return Err(ProtocolError::InvalidToken("DNS name too long".into()));
    }

    packet.extend_from_slice(&QTYPE_A.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Sink for query names
#[async_trait]
pub trait CovertChannel: Send + Sync {
    async fn emit(&self, resolver: SocketAddr, qname: &str) -> Result<()>;
}

/// Fire-and-forget UDP queries
#[derive(Debug)]
pub struct UdpCovertChannel {
    socket: UdpSocket,
}

impl UdpCovertChannel {
    pub async fn bind(addr: &str) -> Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl CovertChannel for UdpCovertChannel {
    #[instrument(skip(self, qname), fields(len = qname.len()))]
    async fn emit(&self, resolver: SocketAddr, qname: &str) -> Result<()> {
        let id: u16 = rand::rng().random();
        let packet = encode_query(id, qname)?;
        self.socket.send_to(&packet, resolver).await?;
        debug!(%resolver, "Covert query sent");
        Ok(())
    }
}
