// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Remote store listeners.
//!
//! One task per subscribed prefix forwards store events into the
//! reconciler. Each (re)subscription is bracketed as a resync: the store
//! replays the whole subtree, and keys it no longer mentions are removed
//! when the replay completes. Transient failures resubscribe after a
//! jittered backoff; a permission failure cancels the listener for good.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use lsync_core::KeyPrefix;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::SyncNotice;
use crate::reconciler::{Ingest, Source};
use crate::store::{RemoteStore, StoreError, StoreMessage};

pub(crate) struct ListenerSet<S> {
    store: Arc<S>,
    ingest: mpsc::UnboundedSender<Ingest>,
    notices: broadcast::Sender<SyncNotice>,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    active: Mutex<HashMap<KeyPrefix, CancellationToken>>,
}

impl<S: RemoteStore> ListenerSet<S> {
    pub fn new(
        store: Arc<S>,
        ingest: mpsc::UnboundedSender<Ingest>,
        notices: broadcast::Sender<SyncNotice>,
        policy: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        ListenerSet { store, ingest, notices, policy, cancel, active: Mutex::new(HashMap::new()) }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<KeyPrefix, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts listening under `prefix`. Returns false if already listening.
    pub fn listen(&self, prefix: KeyPrefix) -> bool {
        let mut active = self.active();
        if active.get(&prefix).is_some_and(|token| !token.is_cancelled()) {
            return false;
        }
        let token = self.cancel.child_token();
        active.insert(prefix.clone(), token.clone());

        let task = ListenTask {
            store: Arc::clone(&self.store),
            prefix,
            ingest: self.ingest.clone(),
            notices: self.notices.clone(),
            policy: self.policy,
        };
        tokio::spawn(task.run(token));
        true
    }

    /// Stops listening under `prefix`. Already applied events stay applied.
    pub fn unlisten(&self, prefix: &KeyPrefix) -> bool {
        match self.active().remove(prefix) {
            Some(token) => {
                let live = !token.is_cancelled();
                token.cancel();
                live
            }
            None => false,
        }
    }

    /// Prefixes with a live listener.
    pub fn prefixes(&self) -> Vec<KeyPrefix> {
        let mut prefixes: Vec<KeyPrefix> = self
            .active()
            .iter()
            .filter(|(_, token)| !token.is_cancelled())
            .map(|(prefix, _)| prefix.clone())
            .collect();
        prefixes.sort();
        prefixes
    }
}

struct ListenTask<S> {
    store: Arc<S>,
    prefix: KeyPrefix,
    ingest: mpsc::UnboundedSender<Ingest>,
    notices: broadcast::Sender<SyncNotice>,
    policy: BackoffPolicy,
}

impl<S: RemoteStore> ListenTask<S> {
    async fn run(self, cancel: CancellationToken) {
        let prefix = &self.prefix;
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let delay = self.policy.jittered(attempt);
                debug!(%prefix, attempt, ?delay, "resubscribing after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return,
                subscribed = self.store.subscribe(prefix) => subscribed,
            };
            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) if is_permanent(&e) => return self.cancelled(&cancel, e),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!(%prefix, attempt, error = %e, "subscribe failed");
                    continue;
                }
            };

            if !self.forward(Ingest::ResyncStarted { source: Source::Store, prefix: prefix.clone() }) {
                return;
            }
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = stream.next() => item,
                };
                let forwarded = match item {
                    Some(Ok(StoreMessage::Event(event))) => {
                        self.forward(Ingest::Event { source: Source::Store, event })
                    }
                    Some(Ok(StoreMessage::Synced)) => {
                        info!(%prefix, "listener synced");
                        attempt = 0;
                        self.forward(Ingest::ResyncFinished {
                            source: Source::Store,
                            prefix: prefix.clone(),
                        })
                    }
                    Some(Err(e)) if is_permanent(&e) => return self.cancelled(&cancel, e),
                    Some(Err(e)) => {
                        warn!(%prefix, error = %e, "listener lost");
                        break;
                    }
                    None => {
                        warn!(%prefix, "listener stream ended");
                        break;
                    }
                };
                if !forwarded {
                    return;
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    fn forward(&self, ingest: Ingest) -> bool {
        self.ingest.send(ingest).is_ok()
    }

    fn cancelled(&self, cancel: &CancellationToken, err: StoreError) {
        warn!(prefix = %self.prefix, error = %err, "listener cancelled");
        cancel.cancel();
        let _ = self
            .notices
            .send(SyncNotice::ListenerCancelled { prefix: self.prefix.clone(), reason: err.to_string() });
    }
}

fn is_permanent(err: &StoreError) -> bool {
    matches!(err, StoreError::Denied(_) | StoreError::Rejected(_))
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
