// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Relay state.
//!
//! Wraps the server-authoritative key tree and the applied-write log for
//! thread-safe access.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use lsync_core::{jsonl, KeyPrefix, RecordKey, Result, StoreEvent, Version};

const LOG_FILE: &str = "writes.jsonl";

/// One applied write as persisted in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedWrite {
    pub client_id: String,
    pub client_seq: u64,
    pub key: RecordKey,
    pub value: Value,
    pub version: Version,
}

/// How a relay is backed.
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Directory holding the write log; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Subtrees that refuse writes.
    pub read_only: Vec<KeyPrefix>,
}

/// Result of applying a client write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Applied now at `version`.
    Applied(Version),
    /// Already applied earlier; the original version is returned.
    Duplicate(Version),
    /// Refused; the write will never be applied.
    Refused(String),
}

#[derive(Default)]
struct Tree {
    records: BTreeMap<RecordKey, (Value, Version)>,
    version: Version,
    acks: HashMap<(String, u64), Version>,
}

impl Tree {
    /// Applies `write` and returns the event it produced, if any.
    fn apply(&mut self, write: &LoggedWrite) -> Option<StoreEvent> {
        self.version = self.version.max(write.version);
        self.acks.insert((write.client_id.clone(), write.client_seq), write.version);
        let key = write.key.clone();
        if write.value.is_null() {
            return self.records.remove(&key).map(|_| StoreEvent::removed(key, write.version));
        }
        match self.records.insert(key.clone(), (write.value.clone(), write.version)) {
            Some(_) => Some(StoreEvent::changed(key, write.value.clone(), write.version)),
            None => Some(StoreEvent::added(key, write.value.clone(), write.version)),
        }
    }
}

/// Shared relay state.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayStateInner>,
}

struct RelayStateInner {
    tree: Mutex<Tree>,
    /// Applied-write log; `None` keeps everything in memory.
    log_path: Option<PathBuf>,
    /// Subtrees that refuse writes.
    read_only: Vec<KeyPrefix>,
    /// Every applied change, for the connections to filter.
    events_tx: broadcast::Sender<StoreEvent>,
}

impl RelayState {
    /// Creates an empty in-memory relay that accepts every write.
    pub fn in_memory() -> Self {
        Self::build(Tree::default(), None, Vec::new())
    }

    /// Opens the relay described by `options`, rebuilding the tree from
    /// the write log when a data directory is set.
    pub fn open(options: &RelayOptions) -> Result<Self> {
        let Some(data_dir) = &options.data_dir else {
            return Ok(Self::build(Tree::default(), None, options.read_only.clone()));
        };
        std::fs::create_dir_all(data_dir)?;
        let log_path = data_dir.join(LOG_FILE);

        let mut tree = Tree::default();
        let writes = jsonl::read_all::<LoggedWrite>(&log_path)?;
        for write in &writes {
            tree.apply(write);
        }
        info!(writes = writes.len(), keys = tree.records.len(), version = tree.version, "relay state loaded");
        Ok(Self::build(tree, Some(log_path), options.read_only.clone()))
    }

    fn build(tree: Tree, log_path: Option<PathBuf>, read_only: Vec<KeyPrefix>) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        RelayState {
            inner: Arc::new(RelayStateInner { tree: Mutex::new(tree), log_path, read_only, events_tx }),
        }
    }

    /// Applies a client write, persisting it before it becomes visible.
    ///
    /// A retried `(client_id, client_seq)` is not applied again.
    pub async fn apply_write(
        &self,
        client_id: &str,
        client_seq: u64,
        key: RecordKey,
        value: Value,
    ) -> Result<WriteOutcome> {
        let mut tree = self.inner.tree.lock().await;
        if let Some(version) = tree.acks.get(&(client_id.to_string(), client_seq)) {
            debug!(client_id, client_seq, version, "duplicate write");
            return Ok(WriteOutcome::Duplicate(*version));
        }
        if let Some(prefix) = self.inner.read_only.iter().find(|p| p.matches(&key)) {
            return Ok(WriteOutcome::Refused(format!("'{key}' is under read-only '{prefix}'")));
        }

        let write = LoggedWrite {
            client_id: client_id.to_string(),
            client_seq,
            key,
            value,
            version: tree.version + 1,
        };
        if let Some(path) = &self.inner.log_path {
            jsonl::append(path, &write)?;
        }
        // Broadcast under the lock so every connection sees versions in order
        if let Some(event) = tree.apply(&write) {
            let _ = self.inner.events_tx.send(event);
        }
        Ok(WriteOutcome::Applied(write.version))
    }

    /// A receiver of every change applied from now on.
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events_tx.subscribe()
    }

    /// The live subtree under `prefix` as `Added` events, with the version
    /// it was taken at. Changes at or below that version are already in it.
    pub async fn replay(&self, prefix: &KeyPrefix) -> (Vec<StoreEvent>, Version) {
        let tree = self.inner.tree.lock().await;
        let events = tree
            .records
            .iter()
            .filter(|(key, _)| prefix.matches(key))
            .map(|(key, (value, version))| StoreEvent::added(key.clone(), value.clone(), *version))
            .collect();
        (events, tree.version)
    }

    /// The current value and version of `key`.
    pub async fn get(&self, key: &RecordKey) -> Option<(Value, Version)> {
        self.inner.tree.lock().await.records.get(key).cloned()
    }

    /// Highest version assigned so far.
    pub async fn version(&self) -> Version {
        self.inner.tree.lock().await.version
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
