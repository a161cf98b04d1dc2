//! # Clock — Injectable Time Source
//!
//! Liveness classification and lease accounting are pure functions of "now",
//! so every component that reasons about time takes an `Arc<dyn Clock>`
//! instead of calling `Utc::now()` directly. Production uses [`SystemClock`];
//! tests drive a [`ManualClock`] forward to cross staleness and lease
//! boundaries deterministically.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use std::time::Instant;

/// Wall-clock and monotonic time source.
pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC). Used for persisted timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant. Used for rate limiting and dedup windows, where
    /// wall-clock jumps must not matter.
    fn monotonic(&self) -> Instant;
}

/// Real time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A settable clock for tests. Wall time is held in a mutex and only moves
/// when the test calls [`ManualClock::advance`] or [`ManualClock::set`];
/// the monotonic source stays real (dedup/rate windows in tests are driven
/// through short real sleeps).
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}
