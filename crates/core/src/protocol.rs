// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket protocol messages for client-relay communication.
//!
//! The protocol is simple:
//! - Client announces itself, writes keys, and subscribes to subtrees
//! - Relay acknowledges writes and pushes keyed change events
//!
//! Every message is one JSON text frame tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::StoreEvent;
use crate::key::{KeyPrefix, RecordKey};
use crate::record::{PendingMutation, Version};

/// Messages sent from client to relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identify the client after connecting.
    Hello {
        client_id: String,
    },

    /// Write a value; JSON `null` removes the key.
    ///
    /// `(client_id, client_seq)` makes retries idempotent: the relay returns
    /// the original acknowledgment instead of applying the write twice.
    Write {
        client_id: String,
        client_seq: u64,
        key: RecordKey,
        value: Value,
    },

    /// Subscribe to every key under a prefix.
    ///
    /// The relay replays the current subtree, then sends `Synced`.
    Subscribe {
        prefix: KeyPrefix,
    },

    /// Stop receiving events for a prefix.
    Unsubscribe {
        prefix: KeyPrefix,
    },

    /// Ping message for keepalive.
    Ping {
        /// Client-chosen ID echoed in Pong.
        id: u64,
    },
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A write was applied (or had already been applied) at `version`.
    Ack {
        client_seq: u64,
        key: RecordKey,
        version: Version,
    },

    /// A write was refused and will never be applied.
    Reject {
        client_seq: u64,
        message: String,
    },

    /// A keyed change under one of the connection's subscriptions.
    Event(StoreEvent),

    /// The initial replay for `prefix` is complete.
    Synced {
        prefix: KeyPrefix,
    },

    /// Pong response to client Ping.
    Pong {
        /// Echoed from the Ping message.
        id: u64,
    },

    /// Error message.
    Error {
        /// Human-readable error description.
        message: String,
    },
}

impl ClientMessage {
    /// Creates a Hello message.
    pub fn hello(client_id: impl Into<String>) -> Self {
        ClientMessage::Hello { client_id: client_id.into() }
    }

    /// Creates a Write message for a pending mutation.
    pub fn write(client_id: impl Into<String>, mutation: &PendingMutation) -> Self {
        ClientMessage::Write {
            client_id: client_id.into(),
            client_seq: mutation.client_seq,
            key: mutation.key.clone(),
            value: mutation.new_value.clone(),
        }
    }

    /// Creates a Subscribe message.
    pub fn subscribe(prefix: KeyPrefix) -> Self {
        ClientMessage::Subscribe { prefix }
    }

    /// Creates an Unsubscribe message.
    pub fn unsubscribe(prefix: KeyPrefix) -> Self {
        ClientMessage::Unsubscribe { prefix }
    }

    /// Creates a Ping message.
    pub fn ping(id: u64) -> Self {
        ClientMessage::Ping { id }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Creates an Ack message.
    pub fn ack(client_seq: u64, key: RecordKey, version: Version) -> Self {
        ServerMessage::Ack { client_seq, key, version }
    }

    /// Creates a Reject message.
    pub fn reject(client_seq: u64, message: impl Into<String>) -> Self {
        ServerMessage::Reject { client_seq, message: message.into() }
    }

    /// Creates an Event message.
    pub fn event(event: StoreEvent) -> Self {
        ServerMessage::Event(event)
    }

    /// Creates a Synced message.
    pub fn synced(prefix: KeyPrefix) -> Self {
        ServerMessage::Synced { prefix }
    }

    /// Creates a Pong message.
    pub fn pong(id: u64) -> Self {
        ServerMessage::Pong { id }
    }

    /// Creates an Error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
