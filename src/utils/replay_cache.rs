//! Replay cache for request-token salts.
//!
//! Every request token carries a fresh 16-byte salt. A token whose salt was
//! already accepted for the same client fingerprint inside the TTL window is a
//! replay. The TTL only needs to outlive the OTP acceptance window, after
//! which the one-time code itself stops verifying.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Default lifetime of a remembered salt: three OTP windows
pub const DEFAULT_TTL: Duration = Duration::from_secs(90);

/// Key for cache entries - client fingerprint plus salt
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    fingerprint: String,
    salt: [u8; 16],
}

/// TTL-bounded salt cache with FIFO eviction
#[derive(Debug)]
pub struct ReplayCache {
    entries: HashMap<CacheKey, Instant>,
    insertion_order: VecDeque<CacheKey>,
    ttl: Duration,
    max_entries: usize,
}

impl ReplayCache {
    /// Default TTL of 90 seconds and at most 10,000 remembered salts
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_TTL, 10_000)
    }

    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Record `salt` for `fingerprint`; returns true if it was already present.
    #[instrument(skip(self, salt))]
    pub fn is_replay(&mut self, fingerprint: &str, salt: &[u8; 16]) -> bool {
        self.cleanup_expired();

        let key = CacheKey {
            fingerprint: fingerprint.to_string(),
            salt: *salt,
        };

        if self.entries.contains_key(&key) {
            warn!(fingerprint, "Replayed request token salt");
            return true;
        }

        while self.entries.len() >= self.max_entries {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.entries.insert(key.clone(), Instant::now());
        self.insertion_order.push_back(key);
        false
    }

    fn cleanup_expired(&mut self) {
        let now = Instant::now();
        let mut removed = 0usize;

        // insertion order is also expiry order
        while let Some(front) = self.insertion_order.front() {
            match self.entries.get(front) {
                Some(added) if now.duration_since(*added) < self.ttl => break,
                _ => {
                    if let Some(key) = self.insertion_order.pop_front() {
                        if self.entries.remove(&key).is_some() {
                            removed += 1;
                        }
                    }
                }
            }
        }

        if removed > 0 {
            debug!(removed, "Expired replay cache entries");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}
