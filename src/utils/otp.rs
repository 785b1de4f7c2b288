//! Time-based one-time codes (RFC 6238, HMAC-SHA1, 6 digits, 30 s step).
//!
//! Request tokens use a fresh TOTP secret per request, so the code's freshness
//! comes from the random salt mixed into the secret as much as from the clock.

use crate::error::{constants, ProtocolError, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// Seconds per TOTP window
pub const TIME_STEP_SECS: u64 = 30;

/// Digits in a code
pub const DIGITS: u32 = 6;

/// Current unix time in seconds
pub fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| ProtocolError::Custom("System time error: time went backwards".into()))
}

/// HOTP value for a counter
fn hotp(key: &[u8], counter: u64) -> Result<u32> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|_| ProtocolError::Custom(constants::ERR_KEY_LENGTH.into()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    Ok(binary % 10u32.pow(DIGITS))
}

/// TOTP code for the given unix time, zero-padded to six digits
pub fn totp_at(key: &[u8], unix_secs: u64) -> Result<String> {
    let code = hotp(key, unix_secs / TIME_STEP_SECS)?;
    Ok(format!("{code:06}"))
}

/// Check a code against the windows adjacent to `unix_secs`
pub fn verify_at(key: &[u8], code: &str, unix_secs: u64, skew_steps: u64) -> Result<bool> {
    let step = unix_secs / TIME_STEP_SECS;
    for counter in step.saturating_sub(skew_steps)..=step + skew_steps {
        if format!("{:06}", hotp(key, counter)?) == code {
            return Ok(true);
        }
    }
    Ok(false)
}
