// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Sync engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid:
//!
//! ```toml
//! url = "wss://relay.example.com/sync"
//! client_id = "device-7"
//! outbox_path = "/var/lib/app/outbox.jsonl"
//! write_route = "transport"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lsync_core::PushIdGenerator;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{Result, SyncError};

/// Where the outbox delivers mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteRoute {
    /// `Write` frames over the transport, acknowledged by `Ack` frames.
    #[default]
    Transport,
    /// Direct writes through the remote store.
    Store,
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// WebSocket URL of the transport peer.
    #[serde(default = "default_url")]
    pub url: String,
    /// Identity sent with every write; the remote deduplicates on
    /// `(client_id, client_seq)`. Set it explicitly when the outbox is durable.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// First reconnect delay ceiling in milliseconds (default: 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Largest reconnect delay ceiling in milliseconds (default: 30000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Automatic reconnect attempts before giving up (default: 10). 0 = unlimited.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Failed sends before a mutation is dropped (default: 5).
    #[serde(default = "default_outbox_max_attempts")]
    pub outbox_max_attempts: u32,
    /// Mutations for distinct keys that may be in flight at once (default: 4).
    #[serde(default = "default_outbox_fanout")]
    pub outbox_fanout: usize,
    /// How long to wait for an acknowledgment in milliseconds (default: 10000).
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Heartbeat ping interval in milliseconds (default: 30000). 0 = disabled.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Max time to wait for pong response in milliseconds (default: 10000).
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default)]
    pub write_route: WriteRoute,
    /// JSONL file that makes the outbox survive restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_path: Option<PathBuf>,
}

fn default_url() -> String {
    "ws://localhost:7890".to_string()
}

fn default_client_id() -> String {
    PushIdGenerator::new().next_id()
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_outbox_max_attempts() -> u32 {
    5
}

fn default_outbox_fanout() -> usize {
    4
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            url: default_url(),
            client_id: default_client_id(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            outbox_max_attempts: default_outbox_max_attempts(),
            outbox_fanout: default_outbox_fanout(),
            ack_timeout_ms: default_ack_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            write_route: WriteRoute::default(),
            outbox_path: None,
        }
    }
}

impl SyncConfig {
    /// Creates a default config pointing at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        SyncConfig { url: url.into(), ..Self::default() }
    }

    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("failed to read config: {}", e)))?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(invalid(format!("url must use ws:// or wss://, got '{}'", self.url)));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("client_id must not be empty"));
        }
        if self.backoff_base_ms == 0 {
            return Err(invalid("backoff_base_ms must be positive"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(invalid("backoff_cap_ms must be at least backoff_base_ms"));
        }
        // A timed-out send must be retried at least once before it can fail.
        if self.outbox_max_attempts < 2 {
            return Err(invalid("outbox_max_attempts must be at least 2"));
        }
        if self.outbox_fanout == 0 {
            return Err(invalid("outbox_fanout must be at least 1"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(invalid("ack_timeout_ms must be positive"));
        }
        if self.heartbeat_interval_ms > 0 && self.heartbeat_timeout_ms == 0 {
            return Err(invalid("heartbeat_timeout_ms must be positive when heartbeats are enabled"));
        }
        Ok(())
    }

    /// Backoff shared by reconnects, listener resubscription and outbox retries.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// `(interval, timeout)`, or `None` when heartbeats are disabled.
    pub fn heartbeat(&self) -> Option<(Duration, Duration)> {
        (self.heartbeat_interval_ms > 0).then(|| {
            (
                Duration::from_millis(self.heartbeat_interval_ms),
                Duration::from_millis(self.heartbeat_timeout_ms),
            )
        })
    }
}

fn invalid(msg: impl Into<String>) -> SyncError {
    SyncError::Config(msg.into())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
