//! Token-bucket rate limiting for client connections.

use std::time::Instant;

/// Burst capacity: at most this many frames in a fresh burst.
pub const BURST_CAPACITY: f64 = 60.0;

/// Steady-state refill rate, tokens per second.
pub const REFILL_PER_SEC: f64 = 10.0;

/// A token bucket. One per connection; the handler task is the only
/// caller, so no interior locking.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last: Instant::now(),
        }
    }

    /// Bucket with the client-connection defaults: 60-frame burst,
    /// 10 frames/s sustained.
    pub fn for_connection() -> Self {
        Self::new(BURST_CAPACITY, REFILL_PER_SEC)
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Take one token, with an explicit clock for tests.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
