// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Mutation senders.
//!
//! The outbox hands each mutation to a [`MutationSender`] and awaits the
//! result. Two routes exist: writing through the transport and waiting for
//! the relay's `Ack` frame, or writing directly to the remote store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use lsync_core::protocol::ClientMessage;
use lsync_core::PendingMutation;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::error::SyncError;
use crate::reconciler::Source;
use crate::store::{RemoteStore, StoreError, WriteAck};
use crate::transport::Frame;

/// Why a single send attempt did not produce an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No session to send on. Not counted as an attempt.
    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    /// The remote refused the write; retrying cannot help.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out waiting for acknowledgment")]
    Timeout,
}

pub type SendResult<T> = Result<T, SendError>;

impl From<StoreError> for SendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => SendError::Transport(reason),
            StoreError::Denied(_) | StoreError::Rejected(_) => SendError::Rejected(err.to_string()),
        }
    }
}

/// Delivers one mutation and resolves with its acknowledgment.
pub trait MutationSender: Send + Sync + 'static {
    fn send(&self, mutation: PendingMutation) -> BoxFuture<'static, SendResult<WriteAck>>;

    /// Which source the acknowledged record is attributed to.
    fn source(&self) -> Source;
}

/// Writes directly to the remote store.
pub struct StoreSender<S> {
    store: Arc<S>,
    client_id: Arc<str>,
    timeout: Duration,
}

impl<S: RemoteStore> StoreSender<S> {
    pub fn new(store: Arc<S>, client_id: impl Into<Arc<str>>, timeout: Duration) -> Self {
        StoreSender { store, client_id: client_id.into(), timeout }
    }
}

impl<S: RemoteStore> MutationSender for StoreSender<S> {
    fn send(&self, mutation: PendingMutation) -> BoxFuture<'static, SendResult<WriteAck>> {
        let store = Arc::clone(&self.store);
        let client_id = Arc::clone(&self.client_id);
        let timeout = self.timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, store.write(&client_id, &mutation)).await {
                Ok(result) => result.map_err(SendError::from),
                Err(_) => Err(SendError::Timeout),
            }
        })
    }

    fn source(&self) -> Source {
        Source::Store
    }
}

type Waiters = HashMap<u64, (u64, oneshot::Sender<SendResult<WriteAck>>)>;

/// Matches `Ack`/`Reject` frames to the sends awaiting them, by client seq.
#[derive(Clone, Default)]
pub(crate) struct AckRouter {
    inner: Arc<Mutex<(u64, Waiters)>>,
}

impl AckRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, (u64, Waiters)> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts waiting for `client_seq`. A later registration for the same
    /// seq replaces this one.
    pub fn register(&self, client_seq: u64) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.lock();
        guard.0 += 1;
        let id = guard.0;
        guard.1.insert(client_seq, (id, tx));
        AckWaiter { client_seq, id, rx, router: self.clone() }
    }

    /// Completes the waiter for `client_seq`. Returns false if nobody waits.
    pub fn resolve(&self, client_seq: u64, result: SendResult<WriteAck>) -> bool {
        let waiter = self.lock().1.remove(&client_seq);
        match waiter {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => {
                debug!(client_seq, "no sender waiting for acknowledgment");
                false
            }
        }
    }

    /// Completes every waiter with `err`.
    pub fn fail_all(&self, err: SendError) {
        let waiters: Vec<_> = self.lock().1.drain().collect();
        for (_, (_, tx)) in waiters {
            let _ = tx.send(Err(err.clone()));
        }
    }

    #[cfg(test)]
    pub fn waiting(&self) -> usize {
        self.lock().1.len()
    }
}

pub(crate) struct AckWaiter {
    client_seq: u64,
    id: u64,
    rx: oneshot::Receiver<SendResult<WriteAck>>,
    router: AckRouter,
}

impl AckWaiter {
    pub async fn wait(mut self, timeout: Duration) -> SendResult<WriteAck> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SendError::Transport("acknowledgment channel closed".into())),
            Err(_) => Err(SendError::Timeout),
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        let mut guard = self.router.lock();
        if guard.1.get(&self.client_seq).is_some_and(|(id, _)| *id == self.id) {
            guard.1.remove(&self.client_seq);
        }
    }
}

/// Writes through the transport and waits for the relay's acknowledgment.
pub(crate) struct TransportSender {
    connection: ConnectionHandle,
    acks: AckRouter,
    client_id: Arc<str>,
    timeout: Duration,
}

impl TransportSender {
    pub fn new(
        connection: ConnectionHandle,
        acks: AckRouter,
        client_id: impl Into<Arc<str>>,
        timeout: Duration,
    ) -> Self {
        TransportSender { connection, acks, client_id: client_id.into(), timeout }
    }
}

impl MutationSender for TransportSender {
    fn send(&self, mutation: PendingMutation) -> BoxFuture<'static, SendResult<WriteAck>> {
        let connection = self.connection.clone();
        let acks = self.acks.clone();
        let client_id = Arc::clone(&self.client_id);
        let timeout = self.timeout;
        Box::pin(async move {
            let text = ClientMessage::write(client_id.as_ref(), &mutation)
                .to_json()
                .map_err(|e| SendError::Rejected(e.to_string()))?;

            // Register before sending so a fast ack is not missed
            let waiter = acks.register(mutation.client_seq);
            match connection.send(Frame::Text(text)).await {
                Ok(()) => {}
                Err(SyncError::NotConnected) | Err(SyncError::Shutdown) => {
                    return Err(SendError::NotConnected)
                }
                Err(e) => return Err(SendError::Transport(e.to_string())),
            }
            waiter.wait(timeout).await
        })
    }

    fn source(&self) -> Source {
        Source::Transport
    }
}

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;
