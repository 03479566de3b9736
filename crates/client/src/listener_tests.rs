// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use super::*;
use crate::store::MemoryStore;
use crate::test_helpers::{key, prefix};
use serde_json::json;

struct Harness {
    store: MemoryStore,
    listeners: ListenerSet<MemoryStore>,
    ingest: mpsc::UnboundedReceiver<Ingest>,
    notices: broadcast::Receiver<SyncNotice>,
    _cancel: tokio_util::sync::DropGuard,
}

fn start() -> Harness {
    let store = MemoryStore::new();
    let (ingest_tx, ingest) = mpsc::unbounded_channel();
    let (notices_tx, notices) = broadcast::channel(16);
    let cancel = CancellationToken::new();
    let policy = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5));
    let listeners =
        ListenerSet::new(Arc::new(store.clone()), ingest_tx, notices_tx, policy, cancel.clone());
    Harness { store, listeners, ingest, notices, _cancel: cancel.drop_guard() }
}

impl Harness {
    async fn next(&mut self) -> String {
        let ingest =
            tokio::time::timeout(Duration::from_secs(2), self.ingest.recv()).await.unwrap().unwrap();
        match ingest {
            Ingest::Event { source: Source::Store, event } => {
                format!("{:?} {} v{}", event.kind, event.key, event.version.unwrap())
            }
            Ingest::ResyncStarted { source: Source::Store, prefix } => format!("start {prefix}"),
            Ingest::ResyncFinished { source: Source::Store, prefix } => format!("finish {prefix}"),
            _ => "unexpected".to_string(),
        }
    }

    async fn assert_quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(self.ingest.try_recv().is_err());
    }
}

#[tokio::test]
async fn replay_is_bracketed_as_resync() {
    let mut h = start();
    h.store.server_write(key("users/a"), json!(1));

    assert!(h.listeners.listen(prefix("users")));
    assert_eq!(h.next().await, "start users");
    assert_eq!(h.next().await, "Added users/a v1");
    assert_eq!(h.next().await, "finish users");

    h.store.server_write(key("users/a"), json!(2));
    assert_eq!(h.next().await, "Changed users/a v2");
}

#[tokio::test]
async fn listening_twice_is_refused() {
    let h = start();
    assert!(h.listeners.listen(prefix("p")));
    assert!(!h.listeners.listen(prefix("p")));
    assert_eq!(h.listeners.prefixes(), vec![prefix("p")]);
}

#[tokio::test]
async fn lost_listener_resubscribes_with_full_replay() {
    let mut h = start();
    h.store.server_write(key("k/a"), json!(1));
    h.listeners.listen(prefix("k"));
    for _ in 0..3 {
        h.next().await;
    }

    h.store.set_online(false);
    h.store.server_write(key("k/b"), json!(2));
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.store.set_online(true);

    assert_eq!(h.next().await, "start k");
    assert_eq!(h.next().await, "Added k/a v1");
    assert_eq!(h.next().await, "Added k/b v2");
    assert_eq!(h.next().await, "finish k");
}

#[tokio::test]
async fn denied_listener_is_cancelled_and_reported() {
    let mut h = start();
    h.store.deny(prefix("secret"));

    h.listeners.listen(prefix("secret/x"));
    let notice = tokio::time::timeout(Duration::from_secs(2), h.notices.recv()).await.unwrap();
    match notice.unwrap() {
        SyncNotice::ListenerCancelled { prefix: cancelled, reason } => {
            assert_eq!(cancelled, prefix("secret/x"));
            assert!(reason.contains("permission denied"));
        }
        other => unreachable!("unexpected notice {other:?}"),
    }
    assert!(h.listeners.prefixes().is_empty());
    h.assert_quiet().await;
}

#[tokio::test]
async fn revoked_access_cancels_a_live_listener() {
    let mut h = start();
    h.listeners.listen(prefix("team"));
    assert_eq!(h.next().await, "start team");
    assert_eq!(h.next().await, "finish team");

    h.store.deny(prefix("team"));
    let notice = tokio::time::timeout(Duration::from_secs(2), h.notices.recv()).await.unwrap();
    assert!(matches!(notice.unwrap(), SyncNotice::ListenerCancelled { .. }));

    // A cancelled prefix may be listened to again
    assert!(h.listeners.listen(prefix("team")));
}

#[tokio::test]
async fn unlisten_stops_forwarding() {
    let mut h = start();
    h.listeners.listen(prefix("k"));
    assert_eq!(h.next().await, "start k");
    assert_eq!(h.next().await, "finish k");

    assert!(h.listeners.unlisten(&prefix("k")));
    assert!(!h.listeners.unlisten(&prefix("k")));
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.store.server_write(key("k/a"), json!(1));
    h.assert_quiet().await;
    assert_eq!(h.store.listener_count(), 0);
}
