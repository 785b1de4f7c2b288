//! Symmetric encryption, key derivation and secret generation.
//!
//! Frames are sealed with XChaCha20-Poly1305 using a fresh 24-byte random
//! nonce per frame. Session keys are derived with SHA-256 from the key material
//! recovered during the handshake and the coordinator's session secret.

use crate::error::{constants, ProtocolError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the per-frame nonce
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag
pub const TAG_LEN: usize = 16;

/// Number of characters in a session secret
pub const SESSION_SECRET_LEN: usize = 16;

const ASCII_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Per-connection authenticated cipher
#[derive(Clone)]
pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Generate a random nonce for one encryption
    pub fn generate_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        fill_random(&mut nonce);
        nonce
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }

    /// Encrypt with a fresh nonce and return `nonce || ciphertext`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Self::generate_nonce();
        let ciphertext = self.encrypt(plaintext, &nonce)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        nonce.zeroize();
        Ok(out)
    }

    /// Inverse of [`Crypto::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        self.decrypt(ciphertext, &nonce)
    }
}

impl fmt::Debug for Crypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Crypto(..)")
    }
}

/// The coordinator's 16-letter session secret.
///
/// It is the handshake reference string: the initiator signs it, it salts the
/// session key derivation, and two of its bytes select the frame delimiter.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret([u8; SESSION_SECRET_LEN]);

impl SessionSecret {
    /// Generate a fresh random secret of ASCII letters
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; SESSION_SECRET_LEN];
        for b in bytes.iter_mut() {
            *b = ASCII_LETTERS[rng.random_range(0..ASCII_LETTERS.len())];
        }
        Self(bytes)
    }

    /// Build a secret from existing bytes (peer side, tests)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SESSION_SECRET_LEN || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(ProtocolError::ConfigError(
                "session secret must be 16 ASCII letters".to_string(),
            ));
        }
        let mut out = [0u8; SESSION_SECRET_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Decode the hex form carried inside request tokens
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|_| ProtocolError::InvalidToken(constants::ERR_KEY_HEX.into()))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

/// Derive the per-connection frame key from handshake key material
pub fn derive_session_key(key_material: &[u8; 32], secret: &SessionSecret) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"covert-mux session");
    hasher.update(key_material);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Lowercase hex SHA-1 fingerprint of key material
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// Fill a buffer from the operating system RNG, falling back to the thread RNG
pub fn fill_random(buf: &mut [u8]) {
    if getrandom::fill(buf).is_err() {
        rand::rng().fill(buf);
    }
}

/// Random string of ASCII letters
pub fn random_letters(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ASCII_LETTERS[rng.random_range(0..ASCII_LETTERS.len())] as char)
        .collect()
}

/// Decode a fixed-size hex key
pub fn decode_key_hex<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|_| ProtocolError::ConfigError(constants::ERR_KEY_HEX.into()))?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::ConfigError(constants::ERR_KEY_LENGTH.into()))
}
