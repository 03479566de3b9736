// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Exponential backoff with full jitter.
//!
//! The delay before attempt `n` (1-based) is drawn uniformly from
//! `[0, min(cap, base * 2^(n-1))]`.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        BackoffPolicy { base, cap }
    }

    /// Upper bound of the delay before `attempt`. Attempt 0 has no delay.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(32);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(1u64 << shift).min(cap_ms))
    }

    /// A jittered delay for `attempt` drawn from `rng`.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }

    /// A jittered delay for `attempt` using the thread-local generator.
    pub fn jittered(&self, attempt: u32) -> Duration {
        self.delay(attempt, &mut rand::thread_rng())
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
