// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Outbox: buffers local mutations and delivers them in order.
//!
//! # Flushing
//!
//! While the connection is `Connected` the flusher walks the queue in
//! submission order. Only the oldest entry of each key is eligible, so
//! writes to one key are acknowledged one at a time, while distinct keys
//! go out concurrently up to the configured fan-out.
//!
//! # Retries
//!
//! A transport error or ack timeout counts as an attempt and the entry is
//! retried after a jittered backoff. Once attempts reach the limit the
//! entry is dropped, its optimistic write is rolled back, and the caller
//! gets `MutationFailed` exactly once. A `Reject` fails the entry at once.
//! Sends refused for lack of a session are not attempts.

mod queue;

pub use queue::{OutboxQueue, QueueError, QueueResult};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use lsync_core::{PendingMutation, RecordKey};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::connection::ConnectionState;
use crate::error::{Result, SyncError, SyncNotice};
use crate::reconciler::Ingest;
use crate::sender::{MutationSender, SendError, SendResult};
use crate::store::WriteAck;

type Ticket = oneshot::Sender<Result<WriteAck>>;

struct Shared {
    queue: Mutex<OutboxQueue>,
    tickets: Mutex<HashMap<u64, Ticket>>,
    wake: Notify,
    ingest: mpsc::UnboundedSender<Ingest>,
}

/// Submission side of the outbox, shared with the engine.
#[derive(Clone)]
pub(crate) struct Outbox {
    shared: Arc<Shared>,
}

impl Outbox {
    pub fn new(queue: OutboxQueue, ingest: mpsc::UnboundedSender<Ingest>) -> Self {
        Outbox {
            shared: Arc::new(Shared {
                queue: Mutex::new(queue),
                tickets: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                ingest,
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, OutboxQueue> {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tickets(&self) -> MutexGuard<'_, HashMap<u64, Ticket>> {
        self.shared.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues a mutation and applies it optimistically.
    ///
    /// The queue lock is held across the reconciler hand-off so local writes
    /// reach the apply loop in seq order.
    pub fn submit(
        &self,
        key: RecordKey,
        value: Value,
    ) -> Result<(PendingMutation, oneshot::Receiver<Result<WriteAck>>)> {
        let (tx, rx) = oneshot::channel();
        let mutation = {
            let mut queue = self.queue();
            let mutation = queue.push(key, value)?;
            self.shared
                .ingest
                .send(Ingest::Local { mutation: mutation.clone() })
                .map_err(|_| SyncError::Shutdown)?;
            self.tickets().insert(mutation.client_seq, tx);
            mutation
        };
        debug!(key = %mutation.key, seq = mutation.client_seq, "mutation queued");
        self.shared.wake.notify_one();
        Ok((mutation, rx))
    }

    /// Re-applies persisted entries as optimistic writes.
    pub fn restore(&self) -> Result<usize> {
        let queue = self.queue();
        for mutation in queue.entries() {
            self.shared
                .ingest
                .send(Ingest::Local { mutation: mutation.clone() })
                .map_err(|_| SyncError::Shutdown)?;
        }
        Ok(queue.len())
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        self.queue().entries().cloned().collect()
    }

    fn resolve(&self, client_seq: u64, result: Result<WriteAck>) {
        if let Some(ticket) = self.tickets().remove(&client_seq) {
            let _ = ticket.send(result);
        }
    }
}

/// Spawns the flusher task.
pub(crate) fn spawn<M: MutationSender>(
    outbox: Outbox,
    sender: M,
    state: watch::Receiver<ConnectionState>,
    config: &SyncConfig,
    notices: broadcast::Sender<SyncNotice>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let flusher = Flusher {
        outbox,
        sender,
        state,
        policy: config.backoff(),
        max_attempts: config.outbox_max_attempts,
        fanout: config.outbox_fanout.max(1),
        notices,
        inflight: FuturesUnordered::new(),
        inflight_keys: HashSet::new(),
        retry_at: HashMap::new(),
        parked: HashSet::new(),
    };
    tokio::spawn(flusher.run(cancel))
}

type InFlight = BoxFuture<'static, (PendingMutation, SendResult<WriteAck>)>;

struct Flusher<M> {
    outbox: Outbox,
    sender: M,
    state: watch::Receiver<ConnectionState>,
    policy: BackoffPolicy,
    max_attempts: u32,
    fanout: usize,
    notices: broadcast::Sender<SyncNotice>,
    inflight: FuturesUnordered<InFlight>,
    inflight_keys: HashSet<RecordKey>,
    retry_at: HashMap<u64, Instant>,
    /// Entries held back only because the session was down.
    parked: HashSet<u64>,
}

impl<M: MutationSender> Flusher<M> {
    async fn run(mut self, cancel: CancellationToken) {
        let shared = Arc::clone(&self.outbox.shared);
        loop {
            self.dispatch();
            let next_retry = self.retry_at.values().min().copied();

            tokio::select! {
                _ = cancel.cancelled() => break,

                Some((mutation, result)) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.settle(mutation, result);
                }

                _ = shared.wake.notified() => {}

                changed = self.state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if self.state.borrow().is_connected() {
                        for seq in self.parked.drain() {
                            self.retry_at.remove(&seq);
                        }
                    }
                }

                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {}
            }
        }
        debug!(pending = self.outbox.queue().len(), "outbox flusher stopped");
    }

    /// Starts sends for every eligible entry.
    fn dispatch(&mut self) {
        if !self.state.borrow().is_connected() {
            return;
        }
        let now = Instant::now();
        let ready: Vec<PendingMutation> = {
            let queue = self.outbox.queue();
            let mut blocked = self.inflight_keys.clone();
            let mut ready = Vec::new();
            for mutation in queue.entries() {
                if self.inflight.len() + ready.len() >= self.fanout {
                    break;
                }
                // Later entries for a key wait behind the oldest one
                if !blocked.insert(mutation.key.clone()) {
                    continue;
                }
                if self.retry_at.get(&mutation.client_seq).is_some_and(|at| *at > now) {
                    continue;
                }
                ready.push(mutation.clone());
            }
            ready
        };

        for mutation in ready {
            debug!(key = %mutation.key, seq = mutation.client_seq, "sending mutation");
            self.retry_at.remove(&mutation.client_seq);
            self.parked.remove(&mutation.client_seq);
            self.inflight_keys.insert(mutation.key.clone());
            let send = self.sender.send(mutation.clone());
            self.inflight.push(Box::pin(async move { (mutation, send.await) }));
        }
    }

    fn settle(&mut self, mut mutation: PendingMutation, result: SendResult<WriteAck>) {
        self.inflight_keys.remove(&mutation.key);
        let seq = mutation.client_seq;

        match result {
            Ok(ack) => {
                info!(key = %mutation.key, seq, version = ack.version, "mutation acknowledged");
                if let Err(e) = self.outbox.queue().remove(seq) {
                    warn!(seq, error = %e, "failed to persist outbox removal");
                }
                let _ = self.outbox.shared.ingest.send(Ingest::Acked {
                    mutation,
                    version: ack.version,
                    source: self.sender.source(),
                });
                self.outbox.resolve(seq, Ok(ack));
            }
            Err(SendError::NotConnected) => {
                // Released early by the next transition to connected
                self.retry_at.insert(seq, Instant::now() + self.policy.ceiling(1));
                self.parked.insert(seq);
            }
            Err(SendError::Rejected(reason)) => self.fail(mutation, reason),
            Err(err) => {
                let attempts = self.outbox.queue().record_attempt(seq).unwrap_or(self.max_attempts);
                mutation.attempts = attempts;
                if attempts >= self.max_attempts {
                    self.fail(mutation, format!("{err} (after {attempts} attempts)"));
                } else {
                    let delay = self.policy.jittered(attempts);
                    warn!(seq, attempts, ?delay, error = %err, "mutation send failed, will retry");
                    self.retry_at.insert(seq, Instant::now() + delay);
                }
            }
        }
    }

    fn fail(&mut self, mutation: PendingMutation, reason: String) {
        let seq = mutation.client_seq;
        warn!(key = %mutation.key, seq, %reason, "mutation failed");
        match self.outbox.queue().remove(seq) {
            Ok(None) => return,
            Ok(Some(_)) => {}
            Err(e) => warn!(seq, error = %e, "failed to persist outbox removal"),
        }
        self.retry_at.remove(&seq);
        self.parked.remove(&seq);
        let _ = self
            .outbox
            .shared
            .ingest
            .send(Ingest::Rollback { key: mutation.key.clone(), client_seq: seq });
        let _ = self
            .notices
            .send(SyncNotice::MutationFailed { mutation: mutation.clone(), reason: reason.clone() });
        self.outbox
            .resolve(seq, Err(SyncError::MutationFailed { mutation: Box::new(mutation), reason }));
    }
}

#[cfg(test)]
mod queue_tests;
