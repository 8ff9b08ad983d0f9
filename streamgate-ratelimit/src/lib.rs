//! Sliding-window rate limiting with a burst allowance.
//!
//! Tracks raw request timestamps per key (sliding window log), admitting
//! up to `rate_limit` requests in any trailing 60s window, with an
//! additional burst clause that allows up to `burst_limit` requests within
//! any trailing 5s window even when the steady-state rate would otherwise
//! be exceeded — mirroring how a real client opens several connections in
//! quick succession (seeking in a video player) without tripping the
//! per-minute limit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Seconds the client should wait before retrying, when denied.
    pub retry_after_secs: u64,
}

/// Sliding-window-log rate limiter with a burst window.
pub struct RateLimiter {
    rate_limit: u64,
    window: Duration,
    burst_limit: u64,
    burst_window: Duration,
    logs: DashMap<String, VecDeque<Instant>>,
    checks_since_purge: AtomicU64,
}

const PURGE_EVERY: u64 = 1000;

impl RateLimiter {
    pub fn new(rate_limit: u64, burst_limit: u64) -> Self {
        Self {
            rate_limit,
            window: Duration::from_secs(60),
            burst_limit,
            burst_window: Duration::from_secs(5),
            logs: DashMap::new(),
            checks_since_purge: AtomicU64::new(0),
        }
    }

    /// Record a request for `key` and decide whether it's admitted.
    pub fn check(&self, key: &str) -> Decision {
        let now = Instant::now();
        let window_cutoff = now - self.window;

        let mut entry = self.logs.entry(key.to_string()).or_default();
        while matches!(entry.front(), Some(t) if *t < window_cutoff) {
            entry.pop_front();
        }
        entry.push_back(now);

        let in_window = entry.len() as u64;
        let decision = if in_window <= self.rate_limit {
            Decision {
                allowed: true,
                retry_after_secs: 0,
            }
        } else {
            let burst_cutoff = now - self.burst_window;
            let in_burst = entry.iter().filter(|t| **t >= burst_cutoff).count() as u64;
            if in_burst <= self.burst_limit {
                Decision {
                    allowed: true,
                    retry_after_secs: 0,
                }
            } else {
                Decision {
                    allowed: false,
                    retry_after_secs: 60,
                }
            }
        };
        drop(entry);

        if self.checks_since_purge.fetch_add(1, Ordering::Relaxed) + 1 >= PURGE_EVERY {
            self.checks_since_purge.store(0, Ordering::Relaxed);
            self.purge_stale(now);
        }

        decision
    }

    /// Drop timestamps older than the window and remove empty buckets.
    /// Called periodically rather than on every request so the cleanup
    /// cost is amortized.
    fn purge_stale(&self, now: Instant) {
        let cutoff = now - self.window;
        self.logs.retain(|_, timestamps| {
            timestamps.retain(|t| *t >= cutoff);
            !timestamps.is_empty()
        });
        tracing::debug!(buckets = self.logs.len(), "rate limiter purge complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_rate_limit() {
        let limiter = RateLimiter::new(5, 0);
        for _ in 0..5 {
            assert!(limiter.check("a").allowed);
        }
        assert!(!limiter.check("a").allowed);
    }

    #[test]
    fn burst_allowance_extends_over_the_limit() {
        let limiter = RateLimiter::new(2, 3);
        // 2 steady + up to 3 more within the burst window should pass.
        for _ in 0..5 {
            assert!(limiter.check("a").allowed);
        }
        assert!(!limiter.check("a").allowed);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, 0);
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }

    #[test]
    fn denied_reports_retry_after() {
        let limiter = RateLimiter::new(1, 0);
        limiter.check("a");
        let decision = limiter.check("a");
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, 60);
    }
}
