// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Versioned records and pending local mutations.
//!
//! Precedence rules:
//! 1. Higher version wins
//! 2. If versions are equal, `Origin::Remote` beats `Origin::Local`
//! 3. Equal version and equal origin is the same write (no-op)
//!
//! A record whose value is JSON `null` is a tombstone: the key was removed
//! but its version is remembered so stale writes cannot resurrect it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::RecordKey;

/// Monotonic per-key version counter assigned by the remote store.
pub type Version = u64;

/// Provenance of a record, used to break version ties.
///
/// Ordering puts `Local` below `Remote`: the remote store is the durability
/// source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Optimistic write minted by this client and not yet confirmed.
    Local,
    /// Value confirmed by the remote store or the transport peer.
    Remote,
}

/// One value in the synchronized tree, as held by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub value: Value,
    pub version: Version,
    pub origin: Origin,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Creates a record.
    pub fn new(
        key: RecordKey,
        value: Value,
        version: Version,
        origin: Origin,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Record { key, value, version, origin, updated_at }
    }

    /// Returns true if this record marks a removed key.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }

    /// The `(version, origin)` pair that orders competing writes.
    pub fn rank(&self) -> (Version, Origin) {
        (self.version, self.origin)
    }

    /// Returns true if a write ranked `(version, origin)` should replace this record.
    pub fn is_superseded_by(&self, version: Version, origin: Origin) -> bool {
        (version, origin) > self.rank()
    }
}

/// A locally originated write owned by the outbox until acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub key: RecordKey,
    pub new_value: Value,
    /// Monotonic local submission counter; doubles as the idempotency token.
    pub client_seq: u64,
    /// Failed send attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

impl PendingMutation {
    /// Creates a mutation that has not been attempted yet.
    pub fn new(key: RecordKey, new_value: Value, client_seq: u64) -> Self {
        PendingMutation { key, new_value, client_seq, attempts: 0 }
    }

    /// Returns true if this mutation removes its key.
    pub fn is_removal(&self) -> bool {
        self.new_value.is_null()
    }
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
