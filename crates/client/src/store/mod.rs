// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Remote store boundary.
//!
//! A path-addressed key/value tree with server-assigned versions and push
//! listeners. A subscription first replays every key under its prefix as
//! `Added` events, then yields [`StoreMessage::Synced`], then live changes.
//! Per-key ordering is guaranteed; cross-key ordering is not.

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use lsync_core::{KeyPrefix, PendingMutation, RecordKey, StoreEvent, Version};

mod memory;

pub use memory::MemoryStore;

#[cfg(test)]
mod memory_tests;

/// Error type for remote store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transient: the store could not be reached. Callers retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Permanent: the caller may not read or write this path.
    #[error("permission denied: {0}")]
    Denied(String),

    /// Permanent: the store refused this particular write.
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Result type for remote store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One item of a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreMessage {
    Event(StoreEvent),
    /// The initial replay of the subscribed subtree is complete.
    Synced,
}

/// Confirmation that a write was applied at `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub key: RecordKey,
    pub version: Version,
}

pub type StoreStream = BoxStream<'static, StoreResult<StoreMessage>>;

/// A remote store with live listeners.
///
/// A stream yielding `Err` or ending means the listener was lost; the
/// subscriber re-subscribes and receives a full replay.
pub trait RemoteStore: Send + Sync + 'static {
    /// Opens a listener on every key under `prefix`.
    fn subscribe(&self, prefix: &KeyPrefix) -> BoxFuture<'_, StoreResult<StoreStream>>;

    /// Applies a mutation. Retrying the same `(client_id, client_seq)`
    /// returns the original acknowledgment without applying it twice.
    fn write<'a>(
        &'a self,
        client_id: &'a str,
        mutation: &'a PendingMutation,
    ) -> BoxFuture<'a, StoreResult<WriteAck>>;
}
