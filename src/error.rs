//! # Error Types
//!
//! Error handling for the tunnel protocol and connection pool.
//!
//! Every failure is scoped: it affects one token, one frame, one stream or one
//! physical connection, never the whole pool.
//!
//! ## Error Categories
//! - **Authentication**: bad handshake signature or undecryptable key material;
//!   the connection is closed and never retried at this layer
//! - **Frame decode**: malformed id, sequence or ciphertext; the frame is dropped
//!   and the connection stays open
//! - **Transient I/O**: would-block or empty reads; retried on the next readiness event
//! - **Pool**: no live connection to serve a stream, or no free slot for a new connection
//! - **Port mapping**: conflicts reported by the port-mapping collaborator
//!
//! ## Example Usage
//! ```rust
//! use covert_mux::error::{ProtocolError, Result};
//!
//! fn admit(live_connections: usize) -> Result<()> {
//!     if live_connections == 0 {
//!         return Err(ProtocolError::PoolExhausted);
//!     }
//!     Ok(())
//! }
//!
//! assert!(admit(0).is_err());
//! assert!(admit(1).is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Token errors
    pub const ERR_TOKEN_FIELD_COUNT: &str = "Unexpected number of token labels";
    pub const ERR_TOKEN_LABEL_LENGTH: &str = "Token label must be 1 to 63 characters";
    pub const ERR_TOKEN_HEADER: &str = "Malformed token header label";
    pub const ERR_TOKEN_TAG: &str = "Malformed mode/version tag";
    pub const ERR_TOKEN_OTP: &str = "One-time code does not match";
    pub const ERR_TOKEN_REPLAY: &str = "Token salt already seen";
    pub const ERR_TOKEN_CERTIFICATE: &str = "Obfuscation level requires certificate material";

    /// Handshake errors
    pub const ERR_BAD_SIGNATURE: &str = "Handshake signature does not verify";
    pub const ERR_BAD_SIGNATURE_ENCODING: &str = "Handshake signature region is not padded hex";
    pub const ERR_SEALED_KEY: &str = "Sealed key material could not be opened";
    pub const ERR_HANDSHAKE_CLOSED: &str = "Handshake already closed";
    pub const ERR_HANDSHAKE_STALLED: &str = "Too many empty reads while waiting for handshake";
    pub const ERR_HANDSHAKE_EOF: &str = "Peer closed before completing handshake";

    /// Frame errors
    pub const ERR_FRAME_TOO_SHORT: &str = "Frame shorter than id and sequence header";
    pub const ERR_FRAME_STREAM_ID: &str = "Frame stream id is not two ASCII characters";
    pub const ERR_FRAME_SEQUENCE: &str = "Frame sequence is not three ASCII digits";
    pub const ERR_FRAME_RESERVED: &str = "Reserved stream id carries data";
    pub const ERR_FRAME_BASE64: &str = "Frame segment is not valid base64";
    pub const ERR_FRAME_OVERSIZED: &str = "Frame segment exceeds maximum size";

    /// Key errors
    pub const ERR_KEY_LENGTH: &str = "Key material has the wrong length";
    pub const ERR_KEY_HEX: &str = "Key material is not valid hex";
}

// ProtocolError is the primary error type for all tunnel operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    #[error("Operation would block")]
    WouldBlock,

    #[error("No live connection available")]
    PoolExhausted,

    #[error("Connection pool is full")]
    PoolFull,

    #[error("Port {0} is already mapped")]
    PortConflict(u16),

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Invalid request token: {0}")]
    InvalidToken(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Classify a socket read failure, keeping would-block distinct from hard I/O errors
    pub fn from_read(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => ProtocolError::WouldBlock,
            _ => ProtocolError::Io(e),
        }
    }

    /// Errors that should simply be retried on the next readiness event
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::WouldBlock => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Errors that end the physical connection they occurred on
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthenticationFailure(_)
                | ProtocolError::HandshakeError(_)
                | ProtocolError::Timeout
                | ProtocolError::ConnectionClosed
        ) || matches!(self, ProtocolError::Io(_)) && !self.is_transient()
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
