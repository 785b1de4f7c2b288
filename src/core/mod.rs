//! # Core Wire Components
//!
//! Frame layout, the encrypted frame codec, and the DNS request token.
//!
//! ## Components
//! - **Frame**: plaintext `id || seq || payload` layout and control frames
//! - **Codec**: Tokio codec sealing frames and splitting them on the session delimiter
//! - **Token**: dot-joined connection request carried in DNS query names
//!
//! ## Wire Format
//! ```text
//! base64(nonce || seal([Id(2)] [Seq(3)] [Payload(0..=4084)])) [Delimiter(7)]
//! ```

pub mod codec;
pub mod frame;
pub mod token;
