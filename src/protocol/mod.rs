//! # Tunnel Protocol
//!
//! Connection authentication and the shared state that multiplexes logical
//! streams over a pool of physical connections.
//!
//! ## Components
//! - **Handshake**: 768-byte authentication blob, sans-IO acceptor and async driver
//! - **Stream Table**: outbound queues, sequence counters and inbound reorder maps
//! - **Pool**: slot array, weighted preferred-connection selection, write cycle

pub mod handshake;
pub mod pool;
pub mod stream_table;

#[cfg(test)]
mod tests;
