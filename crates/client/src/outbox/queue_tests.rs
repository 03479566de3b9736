// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the outbox queue.

#![allow(clippy::unwrap_used)]

use super::queue::*;
use crate::test_helpers::key;
use serde_json::json;
use tempfile::tempdir;

fn seqs(queue: &OutboxQueue) -> Vec<u64> {
    queue.entries().map(|m| m.client_seq).collect()
}

#[test]
fn push_assigns_increasing_seqs_in_order() {
    let mut queue = OutboxQueue::in_memory();
    let a = queue.push(key("a"), json!(1)).unwrap();
    let b = queue.push(key("b"), json!(2)).unwrap();
    let c = queue.push(key("a"), json!(3)).unwrap();

    assert_eq!((a.client_seq, b.client_seq, c.client_seq), (1, 2, 3));
    assert_eq!(seqs(&queue), vec![1, 2, 3]);
    assert_eq!(a.attempts, 0);
    assert!(queue.path().is_none());
}

#[test]
fn remove_keeps_remaining_order() {
    let mut queue = OutboxQueue::in_memory();
    for i in 0..4 {
        queue.push(key("k"), json!(i)).unwrap();
    }

    assert_eq!(queue.remove(2).unwrap().unwrap().new_value, json!(1));
    assert!(queue.remove(2).unwrap().is_none());
    assert_eq!(seqs(&queue), vec![1, 3, 4]);
    assert_eq!(queue.len(), 3);
}

#[test]
fn record_attempt_counts_per_entry() {
    let mut queue = OutboxQueue::in_memory();
    queue.push(key("a"), json!(1)).unwrap();
    queue.push(key("b"), json!(2)).unwrap();

    assert_eq!(queue.record_attempt(1), Some(1));
    assert_eq!(queue.record_attempt(1), Some(2));
    assert_eq!(queue.record_attempt(2), Some(1));
    assert_eq!(queue.record_attempt(9), None);
}

#[test]
fn durable_queue_reloads_entries() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.jsonl");
    {
        let mut queue = OutboxQueue::open(&path).unwrap();
        queue.push(key("a"), json!("x")).unwrap();
        queue.push(key("b"), serde_json::Value::Null).unwrap();
    }

    let mut queue = OutboxQueue::open(&path).unwrap();
    let entries: Vec<_> = queue.entries().cloned().collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].key, key("a"));
    assert!(entries[1].is_removal());

    let next = queue.push(key("c"), json!(1)).unwrap();
    assert_eq!(next.client_seq, 3);
}

#[test]
fn seqs_are_not_reused_after_drain() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.jsonl");
    {
        let mut queue = OutboxQueue::open(&path).unwrap();
        queue.push(key("a"), json!(1)).unwrap();
        queue.push(key("a"), json!(2)).unwrap();
        queue.remove(1).unwrap();
        queue.remove(2).unwrap();
        assert!(queue.is_empty());
    }

    let queue = OutboxQueue::open(&path).unwrap();
    assert!(queue.is_empty());
    assert_eq!(queue.next_seq(), 3);
}

#[test]
fn open_creates_parent_directories() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("outbox.jsonl");
    let mut queue = OutboxQueue::open(&path).unwrap();
    queue.push(key("a"), json!(1)).unwrap();
    assert!(path.exists());
}

#[test]
fn corrupted_file_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.jsonl");
    std::fs::write(&path, "not json\n{\"type\":\"watermark\",\"next_seq\":4}\n").unwrap();

    let err = OutboxQueue::open(&path).err().unwrap();
    assert!(matches!(err, QueueError::Storage(_)));
}
