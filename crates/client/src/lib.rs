// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! lsync: realtime synchronization and connection-management core.
//!
//! Keeps a local key/value tree consistent with a low-latency push
//! transport (WebSocket) and a cloud-synced remote store, under unreliable
//! connectivity.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  frames   ┌─────────────┐
//! │ Connection  │──────────►│   Router    │──┐
//! │ (transport) │◄──────────│ (acks, ping)│  │
//! └─────────────┘           └─────────────┘  │  Ingest   ┌─────────────┐   Update   ┌─────────────┐
//!                                            ├──────────►│ Reconciler  │──────────►│  Registry   │──► observers
//! ┌─────────────┐  events                    │  (FIFO)   │ (apply loop)│           │ (observers) │
//! │  Listener   │────────────────────────────┘           └─────────────┘           └─────────────┘
//! │  (store)    │                                               ▲
//! └─────────────┘                                               │ Local / Acked / Rollback
//!                        ┌─────────────┐   send   ┌─────────────┴┐
//!   submit_mutation ───► │   Outbox    │─────────►│   Sender     │──► transport or store
//!                        │ (FIFO/JSONL)│◄─────────│ (ack/timeout)│
//!                        └─────────────┘   ack    └──────────────┘
//! ```
//!
//! Every inbound event and every local write funnels through one channel
//! into the reconciler's apply loop, which is the only code that mutates
//! record state.

pub mod backoff;
pub mod config;
pub mod connection;
mod engine;
pub mod error;
mod listener;
pub mod outbox;
pub mod reconciler;
pub mod registry;
mod router;
pub mod sender;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use backoff::BackoffPolicy;
pub use config::{SyncConfig, WriteRoute};
pub use connection::{ConnectionHandle, ConnectionState, FrameStream};
pub use engine::{MutationTicket, SyncEngine};
pub use error::{Result, SyncError, SyncNotice};
pub use outbox::OutboxQueue;
pub use reconciler::{Reconciler, Source, Update};
pub use registry::{ObserverHandle, Subscription, SubscriptionRegistry};
pub use sender::SendError;
pub use store::{MemoryStore, RemoteStore, StoreError, StoreMessage, WriteAck};
pub use transport::{Frame, Inbound, Transport, TransportError, WebSocketTransport};

pub use lsync_core::{EventKind, KeyPrefix, Origin, PendingMutation, Record, RecordKey, Version};
