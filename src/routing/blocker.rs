/// Per-source error accounting
///
/// Every failed handshake charges the client's 16-byte source fingerprint;
/// once the counter reaches the route's maximum the source is rejected at
/// accept time. A non-zero timeout resets the counter when that much time
/// has passed since the last attempt; a zero timeout makes blocks permanent
/// for the lifetime of the process.
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use log::{info, warn};

/// Normalized source fingerprint, see [`crate::utils::ip_fingerprint`].
pub type HostKey = [u8; 16];

#[derive(Debug, Clone, Copy)]
struct ErrorCounter {
    count: u64,
    last_attempt: Instant,
}

pub struct ErrorRateBlocker {
    max_connect_errors: u64,
    errors_timeout: Duration,
    counters: Mutex<FnvHashMap<HostKey, ErrorCounter>>,
}

impl ErrorRateBlocker {
    pub fn new(max_connect_errors: u64, errors_timeout: Duration) -> Self {
        Self {
            max_connect_errors,
            errors_timeout,
            counters: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Reset the counter when the error window has elapsed. Returns whether
    /// a reset happened. A zero timeout disables resets entirely.
    pub fn check_errors_time(&self, key: &HostKey) -> bool {
        if self.errors_timeout.is_zero() {
            return false;
        }
        let mut counters = self.counters.lock().expect("error counter lock poisoned");
        if let Some(counter) = counters.get_mut(key) {
            if counter.last_attempt.elapsed() > self.errors_timeout {
                counter.count = 0;
                return true;
            }
        }
        false
    }

    /// Accept-time check: is this source currently over the limit? Applies
    /// the reset window first, so an expired block clears itself here.
    pub fn should_block(&self, key: &HostKey) -> bool {
        let mut counters = self.counters.lock().expect("error counter lock poisoned");
        let Some(counter) = counters.get_mut(key) else {
            return false;
        };
        if counter.count < self.max_connect_errors {
            return false;
        }
        if !self.errors_timeout.is_zero() && counter.last_attempt.elapsed() > self.errors_timeout {
            counter.count = 0;
            return false;
        }
        true
    }

    /// Charge one failed handshake against the source. Returns whether the
    /// source is blocked as of this failure.
    pub fn note_failure(&self, key: &HostKey, source: &str, route: &str) -> bool {
        let mut counters = self.counters.lock().expect("error counter lock poisoned");
        let counter = counters.entry(*key).or_insert(ErrorCounter {
            count: 0,
            last_attempt: Instant::now(),
        });
        counter.last_attempt = Instant::now();
        counter.count += 1;

        if counter.count >= self.max_connect_errors {
            warn!("[{}] blocking client host {}", route, source);
            true
        } else {
            info!(
                "[{}] {} connection errors for {} (max {})",
                route, counter.count, source, self.max_connect_errors
            );
            false
        }
    }

    /// All sources currently over the limit.
    pub fn blocked_hosts(&self) -> Vec<HostKey> {
        let counters = self.counters.lock().expect("error counter lock poisoned");
        counters
            .iter()
            .filter(|(_, c)| c.count >= self.max_connect_errors)
            .map(|(key, _)| *key)
            .collect()
    }

    #[cfg(test)]
    fn count(&self, key: &HostKey) -> u64 {
        self.counters
            .lock()
            .expect("error counter lock poisoned")
            .get(key)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}
