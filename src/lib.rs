//! # covert-mux
//!
//! A DNS-signalled connection pool carrying an authenticated, multiplexed
//! tunnel protocol.
//!
//! A coordinator asks a remote server for connections by emitting request
//! tokens as DNS query names. The server dials back, proves its identity with a
//! 768-byte authentication blob and joins the coordinator's pool. Logical
//! streams, each named by a two-character id, are then multiplexed over the
//! pool as encrypted, delimiter-separated frames.
//!
//! ## Layout
//! - [`core`]: frame layout, frame codec, request tokens
//! - [`protocol`]: handshake, stream table, connection pool
//! - [`service`]: coordinator, request scheduler, remote link
//! - [`transport`]: TCP listener, DNS covert channel, pluggable-transport boundaries
//! - [`utils`]: crypto, one-time codes, logging, metrics, replay cache, timeouts
//! - [`config`]: TOML and environment configuration
//! - [`error`]: `ProtocolError` and the `Result` alias

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::TunnelConfig;
pub use crate::core::codec::FrameCodec;
pub use crate::core::frame::{Frame, StreamId};
pub use crate::core::token::{RequestToken, TokenGenerator, TokenVerifier};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::handshake::{build_auth_blob, HandshakeEngine};
pub use crate::protocol::pool::ConnectionPool;
pub use crate::service::{Coordinator, RemoteLink, RequestScheduler};
