// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Observer registry.
//!
//! Each observer owns an unbounded channel, so dispatch never waits on a
//! slow observer and one observer going away does not affect the others.

use std::collections::BTreeMap;
use std::sync::Mutex;

use lsync_core::KeyPrefix;
use tokio::sync::mpsc;
use tracing::debug;

use crate::reconciler::Update;

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverHandle(u64);

/// The receiving side of a registration.
pub struct Subscription {
    handle: ObserverHandle,
    prefix: KeyPrefix,
    rx: mpsc::UnboundedReceiver<Update>,
}

impl Subscription {
    pub fn handle(&self) -> ObserverHandle {
        self.handle
    }

    pub fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    /// Waits for the next update. Returns `None` once unregistered and
    /// drained, or when the engine shuts down.
    pub async fn next(&mut self) -> Option<Update> {
        self.rx.recv().await
    }

    /// Returns an already delivered update without waiting.
    pub fn try_next(&mut self) -> Option<Update> {
        self.rx.try_recv().ok()
    }
}

struct Observer {
    prefix: KeyPrefix,
    tx: mpsc::UnboundedSender<Update>,
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    observers: BTreeMap<ObserverHandle, Observer>,
}

/// Tracks which observers care about which prefixes.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for every key under `prefix`.
    pub fn register(&self, prefix: KeyPrefix) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_handle += 1;
        let handle = ObserverHandle(inner.next_handle);
        inner.observers.insert(handle, Observer { prefix: prefix.clone(), tx });
        debug!(?handle, %prefix, "observer registered");
        Subscription { handle, prefix, rx }
    }

    /// Stops all future dispatches to `handle`. Updates already delivered
    /// stay in the subscription.
    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.observers.remove(&handle).is_some()
    }

    /// Delivers `update` to every observer whose prefix matches its key.
    /// Observers whose subscription was dropped are removed.
    pub fn dispatch(&self, update: &Update) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        inner.observers.retain(|handle, observer| {
            if !observer.prefix.matches(&update.key) {
                return !observer.tx.is_closed();
            }
            if observer.tx.send(update.clone()).is_err() {
                debug!(?handle, "observer dropped");
                return false;
            }
            delivered += 1;
            true
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
