// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Chronologically ordered push ids.
//!
//! Format: 20 characters over the alphabet `-0-9A-Z_a-z` (ASCII order):
//! - 8 characters encoding the millisecond timestamp, most significant first
//! - 12 random characters
//!
//! Ids generated by one generator sort strictly increasing even when several
//! are minted in the same millisecond or the wall clock steps backwards.

use std::sync::Mutex;

use rand::Rng;

use crate::clock::{ClockSource, SystemClock};

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

/// Length of every generated id.
pub const PUSH_ID_LEN: usize = TIME_CHARS + RANDOM_CHARS;

struct PushState {
    last_ms: u64,
    last_random: [u8; RANDOM_CHARS],
}

/// Generator of push ids.
pub struct PushIdGenerator<C: ClockSource = SystemClock> {
    clock: C,
    state: Mutex<PushState>,
}

impl PushIdGenerator<SystemClock> {
    /// Creates a generator backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for PushIdGenerator<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ClockSource> PushIdGenerator<C> {
    /// Creates a generator with a custom clock source.
    pub fn with_clock(clock: C) -> Self {
        PushIdGenerator {
            clock,
            state: Mutex::new(PushState { last_ms: 0, last_random: [0; RANDOM_CHARS] }),
        }
    }

    /// Generates the next id.
    pub fn next_id(&self) -> String {
        let physical = self.clock.now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::thread_rng();

        if physical > state.last_ms {
            state.last_ms = physical;
            for slot in state.last_random.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        } else if !increment(&mut state.last_random) {
            // Suffix space for this millisecond is exhausted: borrow the next one
            state.last_ms += 1;
            for slot in state.last_random.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        }

        let mut id = String::with_capacity(PUSH_ID_LEN);
        id.push_str(&encode_time(state.last_ms));
        for &digit in &state.last_random {
            id.push(PUSH_CHARS[usize::from(digit)] as char);
        }
        id
    }
}

/// Adds one to the base-64 suffix. Returns false on overflow.
fn increment(digits: &mut [u8; RANDOM_CHARS]) -> bool {
    for digit in digits.iter_mut().rev() {
        if *digit == 63 {
            *digit = 0;
        } else {
            *digit += 1;
            return true;
        }
    }
    false
}

fn encode_time(mut ms: u64) -> String {
    let mut chars = [b'-'; TIME_CHARS];
    for slot in chars.iter_mut().rev() {
        *slot = PUSH_CHARS[(ms % 64) as usize];
        ms /= 64;
    }
    chars.iter().map(|&c| c as char).collect()
}

/// Decodes the millisecond timestamp embedded in a push id.
pub fn timestamp_of(id: &str) -> Option<u64> {
    if id.len() != PUSH_ID_LEN {
        return None;
    }
    id.bytes().take(TIME_CHARS).try_fold(0u64, |acc, b| {
        let digit = PUSH_CHARS.iter().position(|&c| c == b)? as u64;
        Some(acc * 64 + digit)
    })
}

#[cfg(test)]
#[path = "push_id_tests.rs"]
mod tests;
