//! In-memory token bucket rate limiting (SPEC_FULL §11).
//!
//! Ambient abuse-prevention guard over `joinRoom` attempts and chat
//! messages, grounded in the teacher's `ratelimit/limiter.rs` pattern but
//! downsized to a bare in-memory bucket since this process holds no shared
//! cache — every instance rate-limits independently.

use std::time::Instant;

use dashmap::DashMap;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A per-key token bucket limiter. One instance guards one kind of action
/// (join attempts, chat messages, ...); callers key by `userKey`.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: f64::from(capacity),
            refill_per_sec,
        }
    }

    /// Attempt to consume one token for `key`. Returns `false` when the
    /// caller should be throttled.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        entry.last_refill = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop stale entries so the map doesn't grow unbounded across the
    /// process lifetime. Safe to call periodically from a background tick.
    pub fn sweep(&self, idle_for: std::time::Duration) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < idle_for);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_refills() {
        let limiter = RateLimiter::new(2, 1000.0);
        assert!(limiter.try_acquire("user-a"));
        assert!(limiter.try_acquire("user-a"));
        assert!(!limiter.try_acquire("user-a"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.try_acquire("user-a"));
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RateLimiter::new(1, 0.0);
        assert!(limiter.try_acquire("a"));
        assert!(limiter.try_acquire("b"));
        assert!(!limiter.try_acquire("a"));
    }
}
