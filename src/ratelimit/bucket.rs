//! Token bucket state and the continuous-refill arithmetic.
//!
//! A bucket holds up to `quota.burst` tokens and refills at `quota.rate` tokens per
//! second. Each admitted request consumes one token.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::ratelimit::policy::Quota;

/// Per-key bucket state. `tokens` stays within `[0, burst]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    /// Unix time of the last refill, in milliseconds.
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A freshly observed key starts with a full bucket.
    pub fn full(quota: Quota, now_ms: u64) -> Self {
        Self {
            tokens: quota.burst as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Add tokens for the time elapsed since the last refill, capped at capacity.
    ///
    /// A shrunken quota clamps the stored tokens; nothing else is reset.
    pub fn refill(&mut self, quota: Quota, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let added = elapsed_ms as f64 / 1000.0 * quota.rate as f64;
        self.tokens = (self.tokens + added).clamp(0.0, quota.burst as f64);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    /// Refill, then try to consume one token.
    pub fn take(&mut self, quota: Quota, now_ms: u64) -> Decision {
        self.refill(quota, now_ms);
        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        Decision::from_tokens(allowed, quota, self.tokens, now_ms)
    }
}

/// Outcome of a single `allow` call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Rate that was applied (the `X-RateLimit-Limit` value).
    pub limit: u32,
    /// Whole tokens left after this call.
    pub remaining: u32,
    /// Unix seconds: when the bucket is full again (admitted) or the next token arrives (rejected).
    pub reset_at: u64,
    /// Zero when admitted; at least one second when rejected.
    pub retry_after: Duration,
}

impl Decision {
    pub(crate) fn from_tokens(allowed: bool, quota: Quota, tokens: f64, now_ms: u64) -> Self {
        let rate = quota.rate.max(1) as f64;
        let wait_ms = if allowed {
            0
        } else {
            ((1.0 - tokens) / rate * 1000.0).ceil() as u64
        };
        let reset_in_ms = if allowed {
            ((quota.burst as f64 - tokens).max(0.0) / rate * 1000.0).ceil() as u64
        } else {
            wait_ms
        };
        let remaining = tokens.floor().clamp(0.0, quota.burst as f64) as u32;
        Self::from_parts(allowed, quota.rate, remaining, now_ms, wait_ms, reset_in_ms)
    }

    pub(crate) fn from_parts(
        allowed: bool,
        limit: u32,
        remaining: u32,
        now_ms: u64,
        wait_ms: u64,
        reset_in_ms: u64,
    ) -> Self {
        let retry_after = if allowed {
            Duration::ZERO
        } else {
            Duration::from_secs(div_ceil(wait_ms, 1000).max(1))
        };
        Self {
            allowed,
            limit,
            remaining,
            reset_at: div_ceil(now_ms.saturating_add(reset_in_ms), 1000),
            retry_after,
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs()
    }
}

fn div_ceil(value: u64, divisor: u64) -> u64 {
    value / divisor + u64::from(value % divisor != 0)
}

/// Wall-clock unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Unix-aligned milliseconds that never go backwards.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
    origin_ms: u64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_ms: unix_millis(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
