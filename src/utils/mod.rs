//! # Utility Modules
//!
//! Supporting utilities for cryptography, one-time codes, logging and timing.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 frame sealing, session secret, key derivation
//! - **OTP**: RFC 6238 codes used inside request tokens
//! - **Logging**: `tracing-subscriber` setup from configuration
//! - **Timeout**: Async timeout wrappers and timing constants
//! - **Replay Cache**: TTL-based salt deduplication for request tokens
//! - **Metrics**: Thread-safe observability counters

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod otp;
pub mod replay_cache;
pub mod timeout;

pub use replay_cache::{CacheKey, ReplayCache};
