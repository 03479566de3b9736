// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory remote store.
//!
//! Behaves like a realtime database node: one global version counter,
//! idempotent writes keyed by `(client_id, client_seq)`, and listeners that
//! replay their subtree before streaming changes. Fault controls (going
//! offline, denying a path, failing writes) make it usable as a test double
//! for every failure the sync core handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::stream;
use lsync_core::{KeyPrefix, PendingMutation, RecordKey, StoreEvent, Version};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{RemoteStore, StoreError, StoreMessage, StoreResult, StoreStream, WriteAck};

/// Shared, cloneable in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

struct Listener {
    prefix: KeyPrefix,
    tx: mpsc::UnboundedSender<StoreResult<StoreMessage>>,
}

struct Inner {
    records: BTreeMap<RecordKey, (Value, Version)>,
    version: Version,
    acks: HashMap<(String, u64), WriteAck>,
    listeners: Vec<Listener>,
    online: bool,
    denied: Vec<KeyPrefix>,
    failing_writes: u32,
    applied: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner {
                records: BTreeMap::new(),
                version: 0,
                acks: HashMap::new(),
                listeners: Vec::new(),
                online: true,
                denied: Vec::new(),
                failing_writes: 0,
                applied: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes the store offline (every listener errors and is dropped) or
    /// back online.
    pub fn set_online(&self, online: bool) {
        let mut inner = self.lock();
        inner.online = online;
        if !online {
            for listener in inner.listeners.drain(..) {
                let _ = listener.tx.send(Err(StoreError::Unavailable("connection lost".into())));
            }
        }
    }

    /// Forbids access under `prefix`; open listeners there are cancelled.
    pub fn deny(&self, prefix: KeyPrefix) {
        let mut inner = self.lock();
        inner.listeners.retain(|listener| {
            if prefix.covers(&listener.prefix) {
                let _ = listener.tx.send(Err(StoreError::Denied(format!("read {}", prefix))));
                false
            } else {
                true
            }
        });
        inner.denied.push(prefix);
    }

    /// The next `n` writes fail with [`StoreError::Unavailable`].
    pub fn fail_writes(&self, n: u32) {
        self.lock().failing_writes = n;
    }

    /// Applies a write from some other client.
    pub fn server_write(&self, key: RecordKey, value: Value) -> Version {
        self.lock().apply(key, value)
    }

    /// Delivers an arbitrary event to matching listeners without applying it.
    pub fn inject(&self, event: StoreEvent) {
        self.lock().broadcast(event);
    }

    pub fn get(&self, key: &RecordKey) -> Option<(Value, Version)> {
        self.lock().records.get(key).cloned()
    }

    /// Highest version assigned so far.
    pub fn version(&self) -> Version {
        self.lock().version
    }

    /// Writes applied, not counting idempotent replays.
    pub fn applied_writes(&self) -> u64 {
        self.lock().applied
    }

    pub fn listener_count(&self) -> usize {
        let mut inner = self.lock();
        inner.listeners.retain(|l| !l.tx.is_closed());
        inner.listeners.len()
    }
}

impl Inner {
    fn is_denied(&self, prefix: &KeyPrefix) -> bool {
        self.denied.iter().any(|d| d.covers(prefix))
    }

    fn apply(&mut self, key: RecordKey, value: Value) -> Version {
        self.version += 1;
        self.applied += 1;
        let version = self.version;

        let event = if value.is_null() {
            self.records.remove(&key).map(|_| StoreEvent::removed(key, version))
        } else {
            match self.records.insert(key.clone(), (value.clone(), version)) {
                Some(_) => Some(StoreEvent::changed(key, value, version)),
                None => Some(StoreEvent::added(key, value, version)),
            }
        };
        if let Some(event) = event {
            self.broadcast(event);
        }
        version
    }

    fn broadcast(&mut self, event: StoreEvent) {
        self.listeners.retain(|listener| {
            if !listener.prefix.matches(&event.key) {
                return !listener.tx.is_closed();
            }
            listener.tx.send(Ok(StoreMessage::Event(event.clone()))).is_ok()
        });
    }
}

impl RemoteStore for MemoryStore {
    fn subscribe(&self, prefix: &KeyPrefix) -> BoxFuture<'_, StoreResult<StoreStream>> {
        let prefix = prefix.clone();
        Box::pin(async move {
            let mut inner = self.lock();
            if !inner.online {
                return Err(StoreError::Unavailable("offline".into()));
            }
            if inner.is_denied(&prefix) {
                return Err(StoreError::Denied(format!("read {}", prefix)));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            for (key, (value, version)) in &inner.records {
                if prefix.matches(key) {
                    let event = StoreEvent::added(key.clone(), value.clone(), *version);
                    let _ = tx.send(Ok(StoreMessage::Event(event)));
                }
            }
            let _ = tx.send(Ok(StoreMessage::Synced));
            inner.listeners.push(Listener { prefix, tx });

            let events: StoreStream = Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }));
            Ok(events)
        })
    }

    fn write<'a>(
        &'a self,
        client_id: &'a str,
        mutation: &'a PendingMutation,
    ) -> BoxFuture<'a, StoreResult<WriteAck>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if !inner.online {
                return Err(StoreError::Unavailable("offline".into()));
            }
            if inner.failing_writes > 0 {
                inner.failing_writes -= 1;
                return Err(StoreError::Unavailable("write timed out".into()));
            }
            if inner.is_denied(&KeyPrefix::from(&mutation.key)) {
                return Err(StoreError::Denied(format!("write {}", mutation.key)));
            }

            let token = (client_id.to_string(), mutation.client_seq);
            if let Some(ack) = inner.acks.get(&token) {
                return Ok(ack.clone());
            }

            let version = inner.apply(mutation.key.clone(), mutation.new_value.clone());
            let ack = WriteAck { key: mutation.key.clone(), version };
            inner.acks.insert(token, ack.clone());
            Ok(ack)
        })
    }
}
