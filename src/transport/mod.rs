//! # Transport Layer
//!
//! Byte-stream plumbing underneath the tunnel protocol.
//!
//! ## Components
//! - **TCP**: accept loop with graceful shutdown
//! - **DNS**: covert-channel query encoding and UDP emitter
//! - **Pluggable**: obfuscation-layer and port-mapping boundaries
//!
//! Protocol state never lives here. A connection is just something that
//! satisfies [`TransportStream`]; the pool keeps the per-connection protocol
//! fields separately.

pub mod dns;
pub mod pluggable;
pub mod tcp;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream the tunnel can run over
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
