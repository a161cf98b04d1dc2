//! # Rate Limiting — Token Buckets
//!
//! Two consumers share this module: the heartbeat ingress caps each sensor at
//! 10 requests/second (abuse control, 429 on excess), and the notifier's
//! dispatch loop draws from one global bucket sized by
//! `BROADCAST_RATE_PER_SEC` so the fan-out never exceeds the messenger's
//! tolerated rate in any one-second window.

use std::time::{Duration, Instant};

/// A truncated token bucket. Capacity bounds the burst; `rate_per_sec`
/// replenishes continuously.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket. `rate_per_sec` must be > 0.
    pub fn new(capacity: f64, rate_per_sec: f64, now: Instant) -> Self {
        TokenBucket {
            capacity,
            tokens: capacity,
            rate_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until one token is available. Zero when one is ready now.
    pub fn next_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate_per_sec)
        }
    }

    /// Seconds since the bucket last handed out or refilled tokens. Used to
    /// prune idle per-sensor buckets from the ingress map.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refill)
    }
}
