//! Failed-login rate limiting
//!
//! A token bucket per login identity. Each bucket starts full with the
//! configured attempt budget and refills when the lock period elapses.
//! The attempt that drains the final token is the signal to lock the
//! account; attempts after that stay silent until the window refills, so
//! one burst of failures produces exactly one lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    remaining: u32,
    window_start: Instant,
}

/// Token-bucket store keyed by login identity.
pub struct LoginRateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    tokens: u32,
    period: Duration,
}

impl LoginRateLimiter {
    /// Create a limiter allowing `tokens` failures per `period` and login.
    pub fn new(tokens: u32, period: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            tokens,
            period,
        }
    }

    /// Record one failed login attempt for `login`.
    ///
    /// Returns true exactly when this attempt exhausted the bucket, i.e.
    /// when the caller should lock the account.
    pub fn register_failure(&self, login: &str) -> bool {
        self.register_failure_at(login, Instant::now())
    }

    fn register_failure_at(&self, login: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("limiter lock");
        let bucket = buckets.entry(login.to_string()).or_insert(Bucket {
            remaining: self.tokens,
            window_start: now,
        });

        if now.duration_since(bucket.window_start) >= self.period {
            bucket.remaining = self.tokens;
            bucket.window_start = now;
        }

        if bucket.remaining == 0 {
            // Already exhausted within this window; the lock was issued.
            return false;
        }

        bucket.remaining -= 1;
        bucket.remaining == 0
    }
}
