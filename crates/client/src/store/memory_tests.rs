// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the in-memory store.

#![allow(clippy::unwrap_used)]

use super::*;
use crate::test_helpers::{key, prefix};
use futures_util::StreamExt;
use lsync_core::EventKind;
use serde_json::json;

async fn next(stream: &mut StoreStream) -> StoreResult<StoreMessage> {
    tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap()
}

fn event(msg: StoreResult<StoreMessage>) -> StoreEvent {
    match msg.unwrap() {
        StoreMessage::Event(event) => event,
        StoreMessage::Synced => unreachable!("expected an event"),
    }
}

#[tokio::test]
async fn subscribe_replays_subtree_then_synced() {
    let store = MemoryStore::new();
    store.server_write(key("users/a"), json!(1));
    store.server_write(key("users/b"), json!(2));
    store.server_write(key("rooms/r"), json!(3));

    let mut stream = store.subscribe(&prefix("users")).await.unwrap();

    assert_eq!(event(next(&mut stream).await), StoreEvent::added(key("users/a"), json!(1), 1));
    assert_eq!(event(next(&mut stream).await), StoreEvent::added(key("users/b"), json!(2), 2));
    assert_eq!(next(&mut stream).await.unwrap(), StoreMessage::Synced);
}

#[tokio::test]
async fn live_changes_follow_replay() {
    let store = MemoryStore::new();
    let mut stream = store.subscribe(&prefix("users")).await.unwrap();
    assert_eq!(next(&mut stream).await.unwrap(), StoreMessage::Synced);

    store.server_write(key("users/a"), json!("x"));
    store.server_write(key("users/a"), json!("y"));
    store.server_write(key("other/z"), json!(0));
    store.server_write(key("users/a"), serde_json::Value::Null);

    let kinds: Vec<(EventKind, u64)> = vec![
        event(next(&mut stream).await),
        event(next(&mut stream).await),
        event(next(&mut stream).await),
    ]
    .into_iter()
    .map(|e| (e.kind, e.version.unwrap()))
    .collect();
    assert_eq!(kinds, vec![(EventKind::Added, 1), (EventKind::Changed, 2), (EventKind::Removed, 4)]);
}

#[tokio::test]
async fn write_is_idempotent_per_client_seq() {
    let store = MemoryStore::new();
    let mutation = PendingMutation::new(key("k1"), json!("a"), 1);

    let first = store.write("c1", &mutation).await.unwrap();
    let retry = store.write("c1", &mutation).await.unwrap();
    let other_client = store.write("c2", &mutation).await.unwrap();

    assert_eq!(first, WriteAck { key: key("k1"), version: 1 });
    assert_eq!(retry, first);
    assert_eq!(other_client.version, 2);
    assert_eq!(store.applied_writes(), 2);
}

#[tokio::test]
async fn offline_store_drops_listeners_and_refuses_calls() {
    let store = MemoryStore::new();
    let mut stream = store.subscribe(&KeyPrefix::root()).await.unwrap();
    next(&mut stream).await.unwrap();

    store.set_online(false);
    assert!(matches!(next(&mut stream).await, Err(StoreError::Unavailable(_))));
    assert!(stream.next().await.is_none());
    assert_eq!(store.listener_count(), 0);

    assert!(matches!(
        store.subscribe(&KeyPrefix::root()).await,
        Err(StoreError::Unavailable(_))
    ));
    let mutation = PendingMutation::new(key("k"), json!(1), 1);
    assert!(matches!(store.write("c", &mutation).await, Err(StoreError::Unavailable(_))));

    store.set_online(true);
    assert!(store.write("c", &mutation).await.is_ok());
}

#[tokio::test]
async fn denied_prefix_cancels_listeners() {
    let store = MemoryStore::new();
    let mut stream = store.subscribe(&prefix("private/x")).await.unwrap();
    next(&mut stream).await.unwrap();

    store.deny(prefix("private"));
    assert!(matches!(next(&mut stream).await, Err(StoreError::Denied(_))));
    assert!(matches!(store.subscribe(&prefix("private")).await, Err(StoreError::Denied(_))));

    let mutation = PendingMutation::new(key("private/x/y"), json!(1), 1);
    assert!(matches!(store.write("c", &mutation).await, Err(StoreError::Denied(_))));
}

#[tokio::test]
async fn injected_write_failures_are_transient() {
    let store = MemoryStore::new();
    store.fail_writes(2);
    let mutation = PendingMutation::new(key("k"), json!(1), 1);

    assert!(store.write("c", &mutation).await.is_err());
    assert!(store.write("c", &mutation).await.is_err());
    assert_eq!(store.write("c", &mutation).await.unwrap().version, 1);
}

#[tokio::test]
async fn removing_absent_key_emits_nothing() {
    let store = MemoryStore::new();
    let mut stream = store.subscribe(&KeyPrefix::root()).await.unwrap();
    next(&mut stream).await.unwrap();

    store.server_write(key("ghost"), serde_json::Value::Null);
    store.server_write(key("real"), json!(true));

    assert_eq!(event(next(&mut stream).await).key, key("real"));
    assert_eq!(store.get(&key("ghost")), None);
    assert_eq!(store.version(), 2);
}

#[tokio::test]
async fn dropped_streams_are_pruned() {
    let store = MemoryStore::new();
    let stream = store.subscribe(&KeyPrefix::root()).await.unwrap();
    assert_eq!(store.listener_count(), 1);
    drop(stream);
    assert_eq!(store.listener_count(), 0);
}
