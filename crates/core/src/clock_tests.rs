// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use std::sync::atomic::{AtomicU64, Ordering};

struct FixedClock(AtomicU64);

impl ClockSource for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn system_clock_is_after_2020() {
    // 2020-01-01T00:00:00Z
    assert!(SystemClock.now_ms() > 1_577_836_800_000);
}

#[test]
fn now_utc_follows_now_ms() {
    let clock = FixedClock(AtomicU64::new(1_700_000_000_123));
    assert_eq!(clock.now_utc().timestamp_millis(), 1_700_000_000_123);
}

#[test]
fn reference_and_arc_delegate() {
    let clock = std::sync::Arc::new(FixedClock(AtomicU64::new(42)));
    assert_eq!((&*clock).now_ms(), 42);
    assert_eq!(clock.now_ms(), 42);
}

#[test]
fn to_utc_clamps_out_of_range() {
    assert_eq!(to_utc(u64::MAX), DateTime::<Utc>::default());
    assert_eq!(to_utc(0), DateTime::<Utc>::default());
}
