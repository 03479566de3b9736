// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The sync engine: wires the components together and exposes the upward API.

use std::sync::Arc;

use lsync_core::{KeyPrefix, PendingMutation, PushIdGenerator, Record, RecordKey};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{SyncConfig, WriteRoute};
use crate::connection::{self, ConnectionHandle, ConnectionState};
use crate::error::{Result, SyncError, SyncNotice};
use crate::listener::ListenerSet;
use crate::outbox::{self, Outbox, OutboxQueue};
use crate::reconciler::{self, Ingest, Reconciler};
use crate::registry::{ObserverHandle, Subscription, SubscriptionRegistry};
use crate::router::{self, RouterHandle};
use crate::sender::{AckRouter, StoreSender, TransportSender};
use crate::store::{RemoteStore, WriteAck};
use crate::transport::Transport;

const NOTICE_BUFFER: usize = 256;

/// A submitted mutation and the eventual outcome of its delivery.
pub struct MutationTicket {
    mutation: PendingMutation,
    rx: oneshot::Receiver<Result<WriteAck>>,
}

impl MutationTicket {
    pub fn mutation(&self) -> &PendingMutation {
        &self.mutation
    }

    /// Waits until the mutation is acknowledged or given up on.
    pub async fn wait(self) -> Result<WriteAck> {
        self.rx.await.map_err(|_| SyncError::Shutdown)?
    }
}

/// Realtime sync engine.
///
/// Owns one connection, the store listeners, the outbox and the reconciler.
/// All tasks stop on [`SyncEngine::shutdown`] or when the engine is dropped.
pub struct SyncEngine<S: RemoteStore> {
    connection: ConnectionHandle,
    router: RouterHandle,
    listeners: ListenerSet<S>,
    outbox: Outbox,
    registry: Arc<SubscriptionRegistry>,
    ingest: mpsc::UnboundedSender<Ingest>,
    notices: broadcast::Sender<SyncNotice>,
    push_ids: PushIdGenerator,
    cancel: CancellationToken,
}

impl<S: RemoteStore> SyncEngine<S> {
    /// Validates `config`, reloads a durable outbox, and spawns every task.
    ///
    /// Must be called inside a tokio runtime. Does not connect.
    pub fn start<T: Transport>(config: SyncConfig, transport: T, store: S) -> Result<Self> {
        config.validate()?;
        let queue = match &config.outbox_path {
            Some(path) => OutboxQueue::open(path)?,
            None => OutboxQueue::in_memory(),
        };

        let cancel = CancellationToken::new();
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SubscriptionRegistry::new());
        let store = Arc::new(store);

        tokio::spawn(reconciler::run(
            Reconciler::new(),
            ingest_rx,
            Arc::clone(&registry),
            notices.clone(),
            cancel.clone(),
        ));

        let (connection, _) = connection::spawn(transport, &config, notices.clone(), cancel.clone());
        let acks = AckRouter::new();
        let (router, _) = router::spawn(
            connection.clone(),
            acks.clone(),
            ingest_tx.clone(),
            notices.clone(),
            &config,
            cancel.clone(),
        );

        let outbox = Outbox::new(queue, ingest_tx.clone());
        let restored = outbox.restore()?;
        let state = connection.watch();
        match config.write_route {
            WriteRoute::Transport => {
                let sender = TransportSender::new(
                    connection.clone(),
                    acks,
                    config.client_id.as_str(),
                    config.ack_timeout(),
                );
                outbox::spawn(outbox.clone(), sender, state, &config, notices.clone(), cancel.clone());
            }
            WriteRoute::Store => {
                let sender =
                    StoreSender::new(Arc::clone(&store), config.client_id.as_str(), config.ack_timeout());
                outbox::spawn(outbox.clone(), sender, state, &config, notices.clone(), cancel.clone());
            }
        }

        let listeners = ListenerSet::new(
            store,
            ingest_tx.clone(),
            notices.clone(),
            config.backoff(),
            cancel.clone(),
        );

        info!(url = %config.url, client_id = %config.client_id, route = ?config.write_route, restored, "sync engine started");
        Ok(SyncEngine {
            connection,
            router,
            listeners,
            outbox,
            registry,
            ingest: ingest_tx,
            notices,
            push_ids: PushIdGenerator::new(),
            cancel,
        })
    }

    /// Connects the transport. See [`ConnectionHandle::connect`].
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Closes the transport; no auto-reconnect until [`SyncEngine::connect`].
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch()
    }

    /// Subscribes to every key under `prefix` on both the store and the
    /// transport. Returns false if already listening.
    pub fn listen(&self, prefix: KeyPrefix) -> bool {
        let started = self.listeners.listen(prefix.clone());
        if started {
            self.router.subscribe(prefix);
        }
        started
    }

    /// Stops listening under `prefix`. Applied state is kept.
    pub fn unlisten(&self, prefix: &KeyPrefix) -> bool {
        let stopped = self.listeners.unlisten(prefix);
        self.router.unsubscribe(prefix.clone());
        stopped
    }

    /// Prefixes with a live store listener.
    pub fn listening(&self) -> Vec<KeyPrefix> {
        self.listeners.prefixes()
    }

    /// Registers an observer for changes under `prefix`.
    pub fn register(&self, prefix: KeyPrefix) -> Subscription {
        self.registry.register(prefix)
    }

    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        self.registry.unregister(handle)
    }

    /// Applies `value` optimistically and queues it for delivery.
    /// `Value::Null` removes the key.
    pub fn submit_mutation(&self, key: RecordKey, value: Value) -> Result<MutationTicket> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }
        let (mutation, rx) = self.outbox.submit(key, value)?;
        Ok(MutationTicket { mutation, rx })
    }

    /// Writes `value` under a new chronologically ordered child of `parent`.
    pub fn push(&self, parent: &KeyPrefix, value: Value) -> Result<MutationTicket> {
        let id = self.push_ids.next_id();
        let key = if parent.is_root() {
            RecordKey::new(&id)?
        } else {
            RecordKey::new(parent.as_str())?.child(&id)?
        };
        debug!(%key, "push");
        self.submit_mutation(key, value)
    }

    /// The reconciled record for `key`, if it exists.
    pub async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        let (reply, rx) = oneshot::channel();
        self.ingest
            .send(Ingest::Get { key: key.clone(), reply })
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Every reconciled record under `prefix`, in key order.
    pub async fn snapshot(&self, prefix: &KeyPrefix) -> Result<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.ingest
            .send(Ingest::Snapshot { prefix: prefix.clone(), reply })
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Mutations not yet acknowledged, in submission order.
    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.outbox.pending()
    }

    /// A receiver of asynchronous errors and signals.
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Stops every task. A durable outbox keeps its pending entries.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("sync engine shutting down");
            self.cancel.cancel();
        }
    }
}

impl<S: RemoteStore> Drop for SyncEngine<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
