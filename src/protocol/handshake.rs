//! Connection authentication.
//!
//! A dialled-back connection opens with a fixed 768-byte authentication blob:
//!
//! ```text
//! [0..512)   Ed25519 signature of the session secret, ASCII hex, left-padded with '0'
//! [512..768) ephemeral X25519 public (32) || nonce (24) || XChaCha20-Poly1305(key material || padding) (200)
//! ```
//!
//! The acceptor checks the signature against the remote verifying key, opens
//! the sealed key material with its static X25519 secret and derives the
//! session key from that material and the session secret.
//!
//! **Per-Connection State**
//! Each accepted socket gets its own [`Acceptor`], a sans-IO state machine
//! (`AwaitingAuth -> Authenticated | Closed`). [`HandshakeEngine`] drives one
//! over an async stream with a bounded wait.

use crate::core::codec::FrameCodec;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{derive_session_key, fill_random, Crypto, SessionSecret, NONCE_LEN, TAG_LEN};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{with_timeout_error, HANDSHAKE_INITIAL_DELAY, HANDSHAKE_TIMEOUT};
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument, warn};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Total length of the authentication blob
pub const AUTH_BLOB_LEN: usize = 768;

/// Length of the hex signature region
pub const SIGNATURE_REGION_LEN: usize = 512;

/// Length of the sealed key-material region
pub const SEALED_REGION_LEN: usize = AUTH_BLOB_LEN - SIGNATURE_REGION_LEN;

/// Bytes of key material carried in the sealed region
pub const KEY_MATERIAL_LEN: usize = 32;

const EPHEMERAL_LEN: usize = 32;
const SIGNATURE_HEX_LEN: usize = 2 * ed25519_dalek::SIGNATURE_LENGTH;
const SEALED_PLAINTEXT_LEN: usize = SEALED_REGION_LEN - EPHEMERAL_LEN - NONCE_LEN - TAG_LEN;

/// Default number of empty reads tolerated before giving up
pub const DEFAULT_MAX_EMPTY_READS: u32 = 100;

/// Handshake progress for one socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingAuth,
    Authenticated,
    Closed,
}

/// Result of a successful handshake
#[derive(Debug)]
pub struct Authenticated {
    /// Frame codec keyed for this connection
    pub codec: FrameCodec,
    /// Bytes received after the blob, to seed the frame read buffer
    pub leftover: BytesMut,
}

/// Sealing key for the key-material box
fn sealing_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}

/// Sans-IO acceptor for one inbound connection
pub struct Acceptor {
    state: HandshakeState,
    buffer: BytesMut,
    local_secret: StaticSecret,
    remote_key: VerifyingKey,
    secret: SessionSecret,
    empty_reads: u32,
    max_empty_reads: u32,
}

impl Acceptor {
    pub fn new(
        local_secret: StaticSecret,
        remote_key: VerifyingKey,
        secret: SessionSecret,
        max_empty_reads: u32,
    ) -> Self {
        Self {
            state: HandshakeState::AwaitingAuth,
            buffer: BytesMut::with_capacity(AUTH_BLOB_LEN),
            local_secret,
            remote_key,
            secret,
            empty_reads: 0,
            max_empty_reads,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Bytes still needed before the blob is complete
    pub fn remaining(&self) -> usize {
        AUTH_BLOB_LEN.saturating_sub(self.buffer.len())
    }

    /// Count a read that produced nothing
    pub fn empty_read(&mut self) -> Result<()> {
        self.feed(&[]).map(|_| ())
    }

    /// Buffer `bytes`; once 768 bytes are present, authenticate.
    ///
    /// Returns `Ok(None)` while waiting for more input. Any error leaves the
    /// acceptor `Closed`.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<Authenticated>> {
        if self.state != HandshakeState::AwaitingAuth {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_HANDSHAKE_CLOSED.into(),
            ));
        }

        if bytes.is_empty() {
            self.empty_reads += 1;
            if self.empty_reads > self.max_empty_reads {
                self.state = HandshakeState::Closed;
                return Err(ProtocolError::HandshakeError(
                    constants::ERR_HANDSHAKE_STALLED.into(),
                ));
            }
            return Ok(None);
        }

        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() < AUTH_BLOB_LEN {
            return Ok(None);
        }

        let blob = self.buffer.split_to(AUTH_BLOB_LEN);
        match self.authenticate(&blob) {
            Ok(codec) => {
                self.state = HandshakeState::Authenticated;
                Ok(Some(Authenticated {
                    codec,
                    leftover: std::mem::take(&mut self.buffer),
                }))
            }
            Err(e) => {
                self.state = HandshakeState::Closed;
                self.buffer.clear();
                Err(e)
            }
        }
    }

    fn authenticate(&self, blob: &[u8]) -> Result<FrameCodec> {
        let (signature_region, sealed_region) = blob.split_at(SIGNATURE_REGION_LEN);
        self.verify_signature(signature_region)?;

        let mut material = self.open_key_material(sealed_region)?;
        let session_key = derive_session_key(&material, &self.secret);
        material.zeroize();
        Ok(FrameCodec::new(&session_key, &self.secret))
    }

    fn verify_signature(&self, region: &[u8]) -> Result<()> {
        let bad_encoding =
            || ProtocolError::AuthenticationFailure(constants::ERR_BAD_SIGNATURE_ENCODING.into());

        let (padding, hex_sig) = region.split_at(SIGNATURE_REGION_LEN - SIGNATURE_HEX_LEN);
        if !padding.iter().all(|&b| b == b'0') {
            return Err(bad_encoding());
        }
        let raw: [u8; ed25519_dalek::SIGNATURE_LENGTH] = hex::decode(hex_sig)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(bad_encoding)?;

        let signature = Signature::from_bytes(&raw);
        self.remote_key
            .verify_strict(self.secret.as_bytes(), &signature)
            .map_err(|_| ProtocolError::AuthenticationFailure(constants::ERR_BAD_SIGNATURE.into()))
    }

    fn open_key_material(&self, region: &[u8]) -> Result<[u8; KEY_MATERIAL_LEN]> {
        let sealed_err = || ProtocolError::AuthenticationFailure(constants::ERR_SEALED_KEY.into());

        let (eph_bytes, rest) = region.split_at(EPHEMERAL_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let mut ephemeral = [0u8; EPHEMERAL_LEN];
        ephemeral.copy_from_slice(eph_bytes);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let shared = self.local_secret.diffie_hellman(&PublicKey::from(ephemeral));
        if !shared.was_contributory() {
            return Err(sealed_err());
        }
        let recipient = PublicKey::from(&self.local_secret);
        let mut key = sealing_key(shared.as_bytes(), &ephemeral, recipient.as_bytes());

        let opened = Crypto::new(&key).decrypt(ciphertext, &nonce);
        key.zeroize();
        let mut plain = opened.map_err(|_| sealed_err())?;

        let mut material = [0u8; KEY_MATERIAL_LEN];
        material.copy_from_slice(&plain[..KEY_MATERIAL_LEN]);
        plain.zeroize();
        Ok(material)
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("empty_reads", &self.empty_reads)
            .finish()
    }
}

/// Initiator side: build the blob a remote sends after dialling back.
///
/// Returns the blob and the session key the acceptor will derive from it.
#[instrument(skip_all)]
pub fn build_auth_blob(
    signing_key: &SigningKey,
    acceptor_public: &PublicKey,
    secret: &SessionSecret,
) -> Result<([u8; AUTH_BLOB_LEN], [u8; 32])> {
    let mut blob = [0u8; AUTH_BLOB_LEN];

    let signature = signing_key.sign(secret.as_bytes());
    let padded = format!(
        "{:0>width$}",
        hex::encode(signature.to_bytes()),
        width = SIGNATURE_REGION_LEN
    );
    blob[..SIGNATURE_REGION_LEN].copy_from_slice(padded.as_bytes());

    let mut eph_seed = [0u8; 32];
    fill_random(&mut eph_seed);
    let ephemeral = StaticSecret::from(eph_seed);
    eph_seed.zeroize();
    let eph_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(acceptor_public);
    let mut key = sealing_key(shared.as_bytes(), eph_public.as_bytes(), acceptor_public.as_bytes());

    let mut plain = [0u8; SEALED_PLAINTEXT_LEN];
    fill_random(&mut plain);
    let mut material = [0u8; KEY_MATERIAL_LEN];
    material.copy_from_slice(&plain[..KEY_MATERIAL_LEN]);

    let nonce = Crypto::generate_nonce();
    let ciphertext = Crypto::new(&key).encrypt(&plain, &nonce);
    key.zeroize();
    plain.zeroize();
    let ciphertext = ciphertext?;

    let sealed = &mut blob[SIGNATURE_REGION_LEN..];
    sealed[..EPHEMERAL_LEN].copy_from_slice(eph_public.as_bytes());
    sealed[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN].copy_from_slice(&nonce);
    sealed[EPHEMERAL_LEN + NONCE_LEN..].copy_from_slice(&ciphertext);

    let session_key = derive_session_key(&material, secret);
    material.zeroize();
    debug!("Built authentication blob");
    Ok((blob, session_key))
}

/// Drives an [`Acceptor`] over an async stream with a bounded wait
#[derive(Clone)]
pub struct HandshakeEngine {
    local_secret: StaticSecret,
    remote_key: VerifyingKey,
    secret: SessionSecret,
    timeout: Duration,
    initial_delay: Duration,
    max_empty_reads: u32,
}

impl HandshakeEngine {
    pub fn new(local_secret: StaticSecret, remote_key: VerifyingKey, secret: SessionSecret) -> Self {
        Self {
            local_secret,
            remote_key,
            secret,
            timeout: HANDSHAKE_TIMEOUT,
            initial_delay: HANDSHAKE_INITIAL_DELAY,
            max_empty_reads: DEFAULT_MAX_EMPTY_READS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_empty_reads(mut self, max: u32) -> Self {
        self.max_empty_reads = max;
        self
    }

    pub fn secret(&self) -> &SessionSecret {
        &self.secret
    }

    /// Fresh acceptor for one socket
    pub fn acceptor(&self) -> Acceptor {
        Acceptor::new(
            self.local_secret.clone(),
            self.remote_key,
            self.secret.clone(),
            self.max_empty_reads,
        )
    }

    /// Read and check the authentication blob from `stream`.
    ///
    /// On error the caller closes the socket; there is no retry here.
    #[instrument(skip_all)]
    pub async fn authenticate<S>(&self, stream: &mut S) -> Result<Authenticated>
    where
        S: AsyncRead + Unpin,
    {
        let metrics = global_metrics();
        metrics.handshake_attempt();

        match with_timeout_error(self.drive(stream), self.timeout).await {
            Ok(auth) => {
                metrics.handshake_success();
                debug!("Connection authenticated");
                Ok(auth)
            }
            Err(e) => {
                metrics.handshake_failed();
                warn!(error = %e, "Handshake failed");
                Err(e)
            }
        }
    }

    async fn drive<S>(&self, stream: &mut S) -> Result<Authenticated>
    where
        S: AsyncRead + Unpin,
    {
        if !self.initial_delay.is_zero() {
            tokio::time::sleep(self.initial_delay).await;
        }

        let mut acceptor = self.acceptor();
        let mut buf = vec![0u8; AUTH_BLOB_LEN];
        loop {
            // never read past the blob; frame bytes stay in the socket
            let need = acceptor.remaining();
            match stream
                .read(&mut buf[..need])
                .await
                .map_err(ProtocolError::from_read)
            {
                Ok(0) => {
                    return Err(ProtocolError::HandshakeError(
                        constants::ERR_HANDSHAKE_EOF.into(),
                    ))
                }
                Ok(n) => {
                    if let Some(auth) = acceptor.feed(&buf[..n])? {
                        return Ok(auth);
                    }
                }
                Err(ProtocolError::WouldBlock) => {
                    acceptor.empty_read()?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("timeout", &self.timeout)
            .field("initial_delay", &self.initial_delay)
            .field("max_empty_reads", &self.max_empty_reads)
            .finish_non_exhaustive()
    }
}
