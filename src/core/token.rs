//! Connection-request tokens carried in DNS query names.
//!
//! A token is a dot-joined list of DNS labels:
//!
//! ```text
//! RRPPPP<pub-fp> . <otp> . <secret-hex> . <ip-hex> . <salt-hex> [. cert1 . cert2 | . pad] . MMVV
//! ```
//!
//! - `RR`: requested pool size, 2 uppercase hex digits, clamped to 255
//! - `PPPP`: remote port, 4 uppercase hex digits
//! - `pub-fp`: SHA-1 fingerprint of the coordinator's public key
//! - `otp`: TOTP code keyed by `SHA256(pri-fp || ip-hex || salt-hex || RR)`
//! - `secret-hex`: the session secret, hex-encoded
//! - `ip-hex`: requester IPv4 as hex, or IPv6 as hex followed by `G`
//! - `salt-hex`: 16 random bytes
//! - `cert1 . cert2`: URL-safe base64 certificate split at 50 characters (obfs4 levels)
//! - `pad`: five random letters (meek level)
//! - `MM`: transport mode tag, `VV`: protocol version
//!
//! The session secret travels without encryption of its own beyond whatever
//! the covert channel provides.

use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{fill_random, random_letters, SessionSecret};
use crate::utils::metrics::global_metrics;
use crate::utils::otp;
use crate::utils::replay_cache::ReplayCache;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, instrument};

/// Protocol version tag appended to every token
pub const PROTOCOL_TAG: &str = "01";

/// DNS label length limit
pub const MAX_LABEL_LEN: usize = 63;

/// Length of the first certificate chunk
pub const CERT_CHUNK_LEN: usize = 50;

/// Length of the meek padding label
pub const PADDING_LEN: usize = 5;

/// Transport the server should use to reach the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Direct connect-back from a VPS
    #[default]
    Vps,
    /// Relay through an application-engine front
    Gae,
}

impl TransportMode {
    pub fn tag(self) -> &'static str {
        match self {
            TransportMode::Vps => "00",
            TransportMode::Gae => "01",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "00" => Some(TransportMode::Vps),
            "01" => Some(TransportMode::Gae),
            _ => None,
        }
    }
}

/// Obfuscation material configured on the generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Obfuscation {
    None,
    /// obfs4-style layer: certificate bytes shared with the server
    Certificate(Vec<u8>),
    /// meek-style layer: a random padding label instead of a certificate
    Padding,
}

/// Obfuscation labels as carried in a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObfuscationField {
    None,
    /// URL-safe base64 certificate, already re-joined
    Certificate(String),
    Padding(String),
}

/// Parsed or freshly generated request token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestToken {
    pub requested: u8,
    pub remote_port: u16,
    pub public_fingerprint: String,
    pub otp: String,
    pub secret_hex: String,
    pub ip_hex: String,
    pub salt: [u8; 16],
    pub obfuscation: ObfuscationField,
    pub mode: TransportMode,
    pub version: String,
}

/// Hex form of a requester address
pub fn ip_to_hex(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{:08X}", u32::from(v4)),
        IpAddr::V6(v6) => format!("{:032X}G", u128::from(v6)),
    }
}

/// Inverse of [`ip_to_hex`]
pub fn ip_from_hex(s: &str) -> Result<IpAddr> {
    let invalid = || ProtocolError::InvalidToken(format!("bad address label: {s}"));
    match s.strip_suffix('G') {
        Some(v6) => u128::from_str_radix(v6, 16)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n)))
            .map_err(|_| invalid()),
        None => u32::from_str_radix(s, 16)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
            .map_err(|_| invalid()),
    }
}

/// Per-request TOTP key: hex SHA-256 over the private fingerprint, address, salt and count
pub fn otp_secret(private_fingerprint: &str, ip_hex: &str, salt_hex: &str, count_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(private_fingerprint.as_bytes());
    hasher.update(ip_hex.as_bytes());
    hasher.update(salt_hex.as_bytes());
    hasher.update(count_hex.as_bytes());
    hex::encode(hasher.finalize())
}

fn check_label(label: &str) -> Result<()> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(ProtocolError::InvalidToken(format!(
            "{} (got {})",
            constants::ERR_TOKEN_LABEL_LENGTH,
            label.len()
        )));
    }
    Ok(())
}

impl RequestToken {
    /// Requested count as carried on the wire
    pub fn count_hex(&self) -> String {
        format!("{:02X}", self.requested)
    }

    pub fn salt_hex(&self) -> String {
        hex::encode(self.salt)
    }

    /// Dot-joined token; every label is checked against DNS limits
    pub fn encode(&self) -> Result<String> {
        let mut labels = vec![
            format!(
                "{}{:04X}{}",
                self.count_hex(),
                self.remote_port,
                self.public_fingerprint
            ),
            self.otp.clone(),
            self.secret_hex.clone(),
            self.ip_hex.clone(),
            self.salt_hex(),
        ];
        match &self.obfuscation {
            ObfuscationField::None => {}
            ObfuscationField::Certificate(cert) => {
                let split = cert.len().min(CERT_CHUNK_LEN);
                labels.push(cert[..split].to_string());
                labels.push(cert[split..].to_string());
            }
            ObfuscationField::Padding(pad) => labels.push(pad.clone()),
        }
        labels.push(format!("{}{}", self.mode.tag(), self.version));

        for label in &labels {
            check_label(label)?;
        }
        Ok(labels.join("."))
    }

    /// Full query name under the control domain
    pub fn query_name(&self, ctl_domain: &str) -> Result<String> {
        let name = format!("{}.{}", self.encode()?, ctl_domain.trim_matches('.'));
        if name.len() > 253 {
            return Err(ProtocolError::InvalidToken(format!(
                "query name too long: {} characters",
                name.len()
            )));
        }
        Ok(name)
    }

    /// Parse a token from its dot-joined form (without the control domain)
    pub fn parse(token: &str) -> Result<Self> {
        let labels: Vec<&str> = token.split('.').collect();
        if !(6..=8).contains(&labels.len()) {
            return Err(ProtocolError::InvalidToken(
                constants::ERR_TOKEN_FIELD_COUNT.into(),
            ));
        }
        for label in &labels {
            check_label(label)?;
        }

        let header = labels[0];
        if header.len() < 7 || !header.is_ascii() {
            return Err(ProtocolError::InvalidToken(constants::ERR_TOKEN_HEADER.into()));
        }
        let requested = u8::from_str_radix(&header[..2], 16)
            .map_err(|_| ProtocolError::InvalidToken(constants::ERR_TOKEN_HEADER.into()))?;
        let remote_port = u16::from_str_radix(&header[2..6], 16)
            .map_err(|_| ProtocolError::InvalidToken(constants::ERR_TOKEN_HEADER.into()))?;
        let public_fingerprint = header[6..].to_string();

        let otp = labels[1].to_string();
        if otp.len() != otp::DIGITS as usize || !otp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidToken("bad one-time code label".into()));
        }

        let secret_hex = labels[2].to_string();
        SessionSecret::from_hex(&secret_hex)?;

        let ip_hex = labels[3].to_string();
        ip_from_hex(&ip_hex)?;

        let salt: [u8; 16] = hex::decode(labels[4])
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| ProtocolError::InvalidToken("bad salt label".into()))?;

        let tail = labels[labels.len() - 1];
        if tail.len() != 4 || !tail.is_ascii() {
            return Err(ProtocolError::InvalidToken(constants::ERR_TOKEN_TAG.into()));
        }
        let mode = TransportMode::from_tag(&tail[..2])
            .ok_or_else(|| ProtocolError::InvalidToken(constants::ERR_TOKEN_TAG.into()))?;
        let version = tail[2..].to_string();
        if version != PROTOCOL_TAG {
            return Err(ProtocolError::InvalidToken(format!(
                "unsupported protocol version {version}"
            )));
        }

        let obfuscation = match &labels[5..labels.len() - 1] {
            [] => ObfuscationField::None,
            [pad] => ObfuscationField::Padding(pad.to_string()),
            [a, b] => ObfuscationField::Certificate(format!("{a}{b}")),
            _ => {
                return Err(ProtocolError::InvalidToken(
                    constants::ERR_TOKEN_FIELD_COUNT.into(),
                ))
            }
        };

        Ok(Self {
            requested,
            remote_port,
            public_fingerprint,
            otp,
            secret_hex,
            ip_hex,
            salt,
            obfuscation,
            mode,
            version,
        })
    }

    /// Address the server should connect back to
    pub fn requester_ip(&self) -> Result<IpAddr> {
        ip_from_hex(&self.ip_hex)
    }

    /// Decoded session secret
    pub fn session_secret(&self) -> Result<SessionSecret> {
        SessionSecret::from_hex(&self.secret_hex)
    }

    /// Decoded certificate bytes, if any
    pub fn certificate(&self) -> Result<Option<Vec<u8>>> {
        match &self.obfuscation {
            ObfuscationField::Certificate(cert) => URL_SAFE_NO_PAD
                .decode(cert)
                .map(Some)
                .map_err(|_| ProtocolError::InvalidToken("bad certificate labels".into())),
            _ => Ok(None),
        }
    }
}

/// Builds fresh tokens for the request scheduler
#[derive(Debug, Clone)]
pub struct TokenGenerator {
    pub requested: usize,
    pub remote_port: u16,
    pub public_fingerprint: String,
    pub private_fingerprint: String,
    pub ip: IpAddr,
    pub obfuscation: Obfuscation,
    pub mode: TransportMode,
    pub secret: SessionSecret,
}

impl TokenGenerator {
    /// Token for the current time
    pub fn generate(&self) -> Result<RequestToken> {
        self.generate_at(otp::unix_now()?)
    }

    /// Token whose one-time code is computed for `unix_secs`
    #[instrument(skip(self), fields(port = self.remote_port))]
    pub fn generate_at(&self, unix_secs: u64) -> Result<RequestToken> {
        let requested = self.requested.min(255) as u8;
        let count_hex = format!("{requested:02X}");
        let ip_hex = ip_to_hex(self.ip);

        let mut salt = [0u8; 16];
        fill_random(&mut salt);
        let salt_hex = hex::encode(salt);

        let key = otp_secret(&self.private_fingerprint, &ip_hex, &salt_hex, &count_hex);
        let code = otp::totp_at(key.as_bytes(), unix_secs)?;

        let obfuscation = match &self.obfuscation {
            Obfuscation::None => ObfuscationField::None,
            Obfuscation::Certificate(raw) => {
                ObfuscationField::Certificate(URL_SAFE_NO_PAD.encode(raw))
            }
            Obfuscation::Padding => ObfuscationField::Padding(random_letters(PADDING_LEN)),
        };

        debug!(requested, "Generated request token");

        Ok(RequestToken {
            requested,
            remote_port: self.remote_port,
            public_fingerprint: self.public_fingerprint.clone(),
            otp: code,
            secret_hex: self.secret.to_hex(),
            ip_hex,
            salt,
            obfuscation,
            mode: self.mode,
            version: PROTOCOL_TAG.to_string(),
        })
    }
}

/// Server-side token check: known client, valid one-time code, unseen salt
#[derive(Debug)]
pub struct TokenVerifier {
    /// public fingerprint -> private fingerprint
    clients: HashMap<String, String>,
    replay_cache: ReplayCache,
    skew_steps: u64,
}

impl TokenVerifier {
    pub fn new(replay_cache: ReplayCache) -> Self {
        Self {
            clients: HashMap::new(),
            replay_cache,
            skew_steps: 1,
        }
    }

    pub fn register_client(&mut self, public_fingerprint: &str, private_fingerprint: &str) {
        self.clients.insert(
            public_fingerprint.to_string(),
            private_fingerprint.to_string(),
        );
    }

    pub fn verify(&mut self, token: &RequestToken) -> Result<()> {
        self.verify_at(token, otp::unix_now()?)
    }

    #[instrument(skip(self, token), fields(client = %token.public_fingerprint))]
    pub fn verify_at(&mut self, token: &RequestToken, unix_secs: u64) -> Result<()> {
        let private = self.clients.get(&token.public_fingerprint).ok_or_else(|| {
            ProtocolError::AuthenticationFailure("unknown client fingerprint".into())
        })?;

        let key = otp_secret(private, &token.ip_hex, &token.salt_hex(), &token.count_hex());
        if !otp::verify_at(key.as_bytes(), &token.otp, unix_secs, self.skew_steps)? {
            return Err(ProtocolError::AuthenticationFailure(
                constants::ERR_TOKEN_OTP.into(),
            ));
        }

        if self
            .replay_cache
            .is_replay(&token.public_fingerprint, &token.salt)
        {
            global_metrics().replay_cache_hit();
            return Err(ProtocolError::InvalidToken(constants::ERR_TOKEN_REPLAY.into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PUB_FP: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";
    const PRI_FP: &str = "84983e441c3bd26ebaae4aa1f95129e5e54670f1";

    fn generator(obfuscation: Obfuscation) -> TokenGenerator {
        TokenGenerator {
            requested: 4,
            remote_port: 8000,
            public_fingerprint: PUB_FP.into(),
            private_fingerprint: PRI_FP.into(),
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            obfuscation,
            mode: TransportMode::Vps,
            secret: SessionSecret::from_bytes(b"ABCDEFGHIJKLMNOP").unwrap(),
        }
    }

    #[test]
    fn test_header_layout() {
        let token = generator(Obfuscation::None).generate().unwrap();
        let encoded = token.encode().unwrap();
        assert!(encoded.starts_with(&format!("041F40{PUB_FP}.")));
        assert!(encoded.ends_with(".0001"));
        assert_eq!(encoded.split('.').count(), 6);
    }

    #[test]
    fn test_requested_count_clamped() {
        let mut g = generator(Obfuscation::None);
        g.requested = 4000;
        let token = g.generate().unwrap();
        assert_eq!(token.requested, 255);
        assert!(token.encode().unwrap().starts_with("FF"));
    }

    #[test]
    fn test_parse_inverts_encode() {
        for obfs in [
            Obfuscation::None,
            Obfuscation::Padding,
            Obfuscation::Certificate(vec![0xAB; 60]),
        ] {
            let token = generator(obfs).generate().unwrap();
            let parsed = RequestToken::parse(&token.encode().unwrap()).unwrap();
            assert_eq!(parsed, token);
        }
    }

    #[test]
    fn test_certificate_split_into_two_labels() {
        let token = generator(Obfuscation::Certificate(vec![7u8; 60]))
            .generate()
            .unwrap();
        let encoded = token.encode().unwrap();
        let labels: Vec<&str> = encoded.split('.').collect();
        assert_eq!(labels.len(), 8);
        assert_eq!(labels[5].len(), CERT_CHUNK_LEN);
        assert_eq!(token.certificate().unwrap().unwrap(), vec![7u8; 60]);
    }

    #[test]
    fn test_oversized_certificate_rejected() {
        let token = generator(Obfuscation::Certificate(vec![1u8; 200]))
            .generate()
            .unwrap();
        assert!(matches!(token.encode(), Err(ProtocolError::InvalidToken(_))));
    }

    #[test]
    fn test_ipv6_flag() {
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let hex = ip_to_hex(v6);
        assert!(hex.ends_with('G'));
        assert_eq!(ip_from_hex(&hex).unwrap(), v6);
        assert_eq!(
            ip_from_hex(&ip_to_hex(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))).unwrap(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn test_address_label_is_fixed_width_uppercase() {
        let v4 = ip_to_hex(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(v4, "0A000001");
        let v6 = ip_to_hex("::ab".parse().unwrap());
        assert_eq!(v6.len(), 33);
        assert_eq!(v6, format!("{}ABG", "0".repeat(30)));
        assert_eq!(
            ip_from_hex("0A000001").unwrap(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn test_verifier_accepts_then_rejects_replay() {
        let now = 1_700_000_000;
        let token = generator(Obfuscation::None).generate_at(now).unwrap();
        let mut verifier = TokenVerifier::new(ReplayCache::new());
        verifier.register_client(PUB_FP, PRI_FP);

        verifier.verify_at(&token, now).unwrap();
        assert!(matches!(
            verifier.verify_at(&token, now),
            Err(ProtocolError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_verifier_rejects_wrong_private_fingerprint() {
        let now = 1_700_000_000;
        let token = generator(Obfuscation::None).generate_at(now).unwrap();
        let mut verifier = TokenVerifier::new(ReplayCache::new());
        verifier.register_client(PUB_FP, "0000000000000000000000000000000000000000");

        assert!(matches!(
            verifier.verify_at(&token, now),
            Err(ProtocolError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_tag() {
        let token = generator(Obfuscation::None).generate().unwrap();
        let mut encoded = token.encode().unwrap();
        encoded.truncate(encoded.len() - 4);
        encoded.push_str("0002");
        assert!(RequestToken::parse(&encoded).is_err());
    }
}
