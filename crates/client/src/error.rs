// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the sync core.

use lsync_core::{KeyPrefix, PendingMutation, RecordKey};
use thiserror::Error;

use crate::outbox::QueueError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// All errors surfaced by the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The WebSocket handshake failed. Retries continue in the background.
    #[error("connect failed: {0}")]
    ConnectError(String),

    /// The caller tried to send while the connection is not established.
    #[error("not connected")]
    NotConnected,

    /// The reconnect budget is exhausted; call `connect()` to try again.
    #[error("connection lost after {attempts} attempts: {reason}")]
    ConnectionLost { attempts: u32, reason: String },

    /// The outbox gave up on a mutation. The mutation is returned so the
    /// caller can decide whether to resubmit it.
    #[error("mutation {} on '{}' failed: {reason}", .mutation.client_seq, .mutation.key)]
    MutationFailed { mutation: Box<PendingMutation>, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("outbox error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Core(#[from] lsync_core::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The engine was shut down while the operation was pending.
    #[error("sync engine is shut down")]
    Shutdown,
}

/// A specialized Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Asynchronous signals published to every interested party.
///
/// Errors that have no caller to return to (a background reconnect giving
/// up, a malformed event) are reported here instead of being dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// Auto-reconnect stopped. Nothing happens until `connect()` is called.
    ConnectionLost { attempts: u32, reason: String },
    /// A mutation was dropped from the outbox and its optimistic write undone.
    MutationFailed { mutation: PendingMutation, reason: String },
    /// An inbound event or frame was refused by the reconciler or router.
    EventRejected { key: Option<RecordKey>, reason: String },
    /// A store subscription failed permanently and will not be retried.
    ListenerCancelled { prefix: KeyPrefix, reason: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
