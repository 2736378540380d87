//! Per-source token bucket.
//!
//! Refills continuously at `requests_per_minute / 60` tokens per second up to
//! a burst capacity of `max(1, rpm / 6)`. Time comes from the caller so the
//! bucket can be driven by a [`Clock`](crate::clock::Clock).

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::source::RateLimitPolicy;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        let capacity = f64::from(policy.burst());
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: f64::from(policy.requests_per_minute) / 60.0,
            last_refill: now,
        }
    }

    /// Apply a changed policy, keeping the current fill level within the new capacity.
    pub fn reconfigure(&mut self, policy: &RateLimitPolicy, now: DateTime<Utc>) {
        self.refill(now);
        self.capacity = f64::from(policy.burst());
        self.refill_per_sec = f64::from(policy.requests_per_minute) / 60.0;
        self.tokens = self.tokens.min(self.capacity);
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).num_milliseconds();
        if elapsed <= 0 {
            return;
        }
        self.tokens = (self.tokens + elapsed as f64 / 1000.0 * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub fn available(&mut self, now: DateTime<Utc>) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn has_token(&mut self, now: DateTime<Utc>) -> bool {
        self.available(now) >= 1.0
    }

    /// Take one token if available.
    pub fn try_take(&mut self, now: DateTime<Utc>) -> bool {
        if self.has_token(now) {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token, zero if one is available now.
    pub fn time_until_token(&mut self, now: DateTime<Utc>) -> Duration {
        let missing = 1.0 - self.available(now);
        if missing <= 0.0 || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(missing / self.refill_per_sec)
    }
}
