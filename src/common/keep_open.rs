//! Keep-open policy for a reopenable resource (modem device, GPS socket).
//!
//! The health monitor consults `due()` before re-attempting an open so a
//! flapping resource is retried at a fixed interval instead of in a tight
//! loop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::common::monotime;

pub struct KeepOpen {
    enabled: AtomicBool,
    retry_interval_ms: AtomicU64,
    last_attempt_at: AtomicU64,
    retry_count: AtomicU32,
}

impl KeepOpen {
    pub fn new(retry_interval_ms: u64) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            retry_interval_ms: AtomicU64::new(retry_interval_ms),
            last_attempt_at: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    /// True when a reopen attempt is allowed: policy enabled and the retry
    /// interval has elapsed since the last attempt (or none was made yet).
    pub fn due(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        let last = self.last_attempt_at.load(Ordering::Relaxed);
        last == 0 || monotime::msec_since(last) >= self.retry_interval_ms.load(Ordering::Relaxed)
    }

    pub fn stamp_attempt(&self) {
        self.last_attempt_at.store(monotime::msec_now(), Ordering::Relaxed);
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_until_attempted() {
        let ko = KeepOpen::new(60_000);
        assert!(ko.due());
        ko.stamp_attempt();
        assert!(!ko.due());
        assert_eq!(ko.retry_count(), 1);
    }

    #[test]
    fn disabled_is_never_due() {
        let ko = KeepOpen::new(0);
        ko.set_enabled(false);
        assert!(!ko.due());
    }
}
