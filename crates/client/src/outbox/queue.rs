// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Ordered store of unacknowledged mutations.
//!
//! Optionally backed by a JSONL file: each enqueue appends one line and is
//! fsynced immediately; removals rewrite the file. The first line of a
//! rewritten file records the next client seq, so seqs are never reused
//! after the queue drains.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use lsync_core::{jsonl, PendingMutation, RecordKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] lsync_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboxLine {
    Mutation(PendingMutation),
    Watermark { next_seq: u64 },
}

/// FIFO of pending mutations in client-submission order.
pub struct OutboxQueue {
    entries: VecDeque<PendingMutation>,
    next_seq: u64,
    path: Option<PathBuf>,
}

impl OutboxQueue {
    /// A queue that does not survive the process.
    pub fn in_memory() -> Self {
        OutboxQueue { entries: VecDeque::new(), next_seq: 1, path: None }
    }

    /// Opens (or creates) a durable queue, reloading persisted entries.
    pub fn open(path: &Path) -> QueueResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::new();
        let mut next_seq = 1;
        for line in jsonl::read_all::<OutboxLine>(path)? {
            match line {
                OutboxLine::Mutation(mutation) => {
                    next_seq = next_seq.max(mutation.client_seq + 1);
                    entries.push_back(mutation);
                }
                OutboxLine::Watermark { next_seq: mark } => next_seq = next_seq.max(mark),
            }
        }
        if !entries.is_empty() {
            info!(path = %path.display(), pending = entries.len(), "reloaded outbox");
        }

        Ok(OutboxQueue { entries, next_seq, path: Some(path.to_path_buf()) })
    }

    /// Appends a mutation with the next client seq.
    pub fn push(&mut self, key: RecordKey, value: Value) -> QueueResult<PendingMutation> {
        let mutation = PendingMutation::new(key, value, self.next_seq);
        if let Some(path) = &self.path {
            jsonl::append(path, &OutboxLine::Mutation(mutation.clone()))?;
        }
        self.next_seq += 1;
        self.entries.push_back(mutation.clone());
        Ok(mutation)
    }

    /// Removes the entry with `client_seq`.
    ///
    /// The entry leaves memory even if rewriting the file fails.
    pub fn remove(&mut self, client_seq: u64) -> QueueResult<Option<PendingMutation>> {
        let Some(index) = self.entries.iter().position(|m| m.client_seq == client_seq) else {
            return Ok(None);
        };
        let removed = self.entries.remove(index);
        self.persist()?;
        Ok(removed)
    }

    /// Counts a failed send; returns the new attempt count.
    pub fn record_attempt(&mut self, client_seq: u64) -> Option<u32> {
        let entry = self.entries.iter_mut().find(|m| m.client_seq == client_seq)?;
        entry.attempts += 1;
        Some(entry.attempts)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingMutation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self) -> QueueResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut lines = Vec::with_capacity(self.entries.len() + 1);
        lines.push(OutboxLine::Watermark { next_seq: self.next_seq });
        lines.extend(self.entries.iter().cloned().map(OutboxLine::Mutation));
        jsonl::write_all(path, &lines)?;
        Ok(())
    }
}
