// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! lsync-core: Shared data model for the lsync realtime sync core
//!
//! This crate provides the record model, key paths, wire protocol, and
//! small storage primitives used by both the `lsync` client library and the
//! `lsync-remote` relay server.

pub mod clock;
pub mod error;
pub mod event;
pub mod jsonl;
pub mod key;
pub mod protocol;
pub mod push_id;
pub mod record;

pub use clock::{ClockSource, SystemClock};
pub use error::{Error, Result};
pub use event::{EventKind, StoreEvent};
pub use key::{KeyPrefix, RecordKey};
pub use push_id::PushIdGenerator;
pub use record::{Origin, PendingMutation, Record, Version};
