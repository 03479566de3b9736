// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! lsync-remote: reference relay for the lsync wire protocol.
//!
//! Keeps a server-authoritative versioned key tree, acknowledges writes
//! idempotently, and pushes keyed change events to every subscribed
//! connection.

pub mod server;
pub mod state;

pub use server::{run, serve};
pub use state::{LoggedWrite, RelayOptions, RelayState, WriteOutcome};
