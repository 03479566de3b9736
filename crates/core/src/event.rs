// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound change events from the remote store or the transport peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::RecordKey;
use crate::record::Version;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Changed,
    Removed,
}

/// One keyed change pushed by a remote source.
///
/// `version` is optional on the wire so that unversioned events can be
/// received, rejected and reported instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub key: RecordKey,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    pub kind: EventKind,
}

impl StoreEvent {
    /// Creates an `Added` event.
    pub fn added(key: RecordKey, value: Value, version: Version) -> Self {
        StoreEvent { key, value, version: Some(version), kind: EventKind::Added }
    }

    /// Creates a `Changed` event.
    pub fn changed(key: RecordKey, value: Value, version: Version) -> Self {
        StoreEvent { key, value, version: Some(version), kind: EventKind::Changed }
    }

    /// Creates a `Removed` event.
    pub fn removed(key: RecordKey, version: Version) -> Self {
        StoreEvent { key, value: Value::Null, version: Some(version), kind: EventKind::Removed }
    }
}
