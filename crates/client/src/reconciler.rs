// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! State reconciler.
//!
//! The only code that mutates record state. Every input, whether a
//! transport event, a store event, a local write or an acknowledgment,
//! is applied here in arrival order by one task, so there are no
//! interleaved partial updates.
//!
//! # Conflict rule
//!
//! Each key holds a *confirmed* record (the newest server state this client
//! has seen) and optionally a *local* record layered on top of it (an
//! optimistic write awaiting acknowledgment). An incoming remote record
//! replaces whatever is visible only if `(version, Remote)` ranks above the
//! visible `(version, origin)`, so higher versions win and equal versions
//! break toward the remote store.
//!
//! A local write gets the provisional version `visible + 1`. When its own
//! acknowledgment arrives the local layer is dropped in favour of the
//! confirmed record with the same value, so observers see no change.
//!
//! # Resync
//!
//! A resubscribed listener replays its whole subtree. Between
//! [`Reconciler::begin_resync`] and [`Reconciler::finish_resync`] the keys
//! replayed by that source are recorded; at the end, keys the source
//! previously confirmed but did not replay are removed. Applying a replay is
//! idempotent, so the resulting state matches an uninterrupted stream.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use lsync_core::{
    ClockSource, EventKind, KeyPrefix, Origin, PendingMutation, Record, RecordKey, StoreEvent,
    SystemClock, Version,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SyncNotice;
use crate::registry::SubscriptionRegistry;

/// Where a remote record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Transport,
    Store,
}

/// A visible change produced by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub key: RecordKey,
    /// The new value; `None` when the key was removed.
    pub value: Option<Value>,
    pub version: Version,
    pub origin: Origin,
    pub kind: EventKind,
}

/// Result of applying one input.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The visible value changed.
    Applied(Update),
    /// State was updated but the visible value is the same.
    Unchanged,
    /// The input lost against the held record.
    Stale,
}

#[derive(Debug, Clone)]
struct Confirmed {
    record: Record,
    source: Source,
}

#[derive(Debug, Clone)]
struct LocalWrite {
    record: Record,
    client_seq: u64,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    confirmed: Option<Confirmed>,
    local: Option<LocalWrite>,
}

impl Entry {
    fn current(&self) -> Option<&Record> {
        match (&self.local, &self.confirmed) {
            (Some(local), _) => Some(&local.record),
            (None, Some(confirmed)) => Some(&confirmed.record),
            (None, None) => None,
        }
    }

    fn visible(&self) -> Option<&Record> {
        self.current().filter(|r| !r.is_tombstone())
    }

    /// Replaces the confirmed record if `(version, Remote)` ranks above it.
    fn confirm(&mut self, record: Record, source: Source) -> bool {
        let newer = self
            .confirmed
            .as_ref()
            .map_or(true, |c| c.record.is_superseded_by(record.version, Origin::Remote));
        if newer {
            self.confirmed = Some(Confirmed { record, source });
            self.rebase_local();
        }
        newer
    }

    /// Keeps a pending local write ranked above the confirmed record.
    fn rebase_local(&mut self) {
        if let (Some(local), Some(confirmed)) = (&mut self.local, &self.confirmed) {
            if local.record.version <= confirmed.record.version {
                local.record.version = confirmed.record.version.saturating_add(1);
            }
        }
    }
}

/// Single authoritative owner of local record state.
pub struct Reconciler<C: ClockSource = SystemClock> {
    clock: C,
    entries: BTreeMap<RecordKey, Entry>,
    resyncs: HashMap<(Source, KeyPrefix), HashSet<RecordKey>>,
}

impl Reconciler<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for Reconciler<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ClockSource> Reconciler<C> {
    pub fn with_clock(clock: C) -> Self {
        Reconciler { clock, entries: BTreeMap::new(), resyncs: HashMap::new() }
    }

    /// Applies an event from the transport or the store.
    ///
    /// Events without a version, events at a version no write could follow,
    /// and added/changed events without a value are refused with a reason.
    pub fn apply_remote(
        &mut self,
        source: Source,
        event: StoreEvent,
    ) -> Result<Outcome, &'static str> {
        let version = event.version.ok_or("missing version")?;
        if version == Version::MAX {
            return Err("version out of range");
        }
        let value = match event.kind {
            EventKind::Removed => Value::Null,
            EventKind::Added | EventKind::Changed if event.value.is_null() => {
                return Err("missing value");
            }
            EventKind::Added | EventKind::Changed => event.value,
        };
        if event.kind != EventKind::Removed {
            self.mark_seen(source, &event.key);
        }
        Ok(self.apply_confirmed(source, event.key, value, version))
    }

    /// Applies a local optimistic write at a provisional version.
    ///
    /// A key already at the highest version cannot take a newer one; the
    /// write is left to the server and reported as stale.
    pub fn apply_local(&mut self, mutation: &PendingMutation) -> Outcome {
        let now = self.clock.now_utc();
        let entry = self.entries.entry(mutation.key.clone()).or_default();
        let before = entry.visible().cloned();

        let Some(version) = entry.current().map_or(Some(1), |r| r.version.checked_add(1)) else {
            warn!(key = %mutation.key, "no version left above the held record");
            return Outcome::Stale;
        };
        let record =
            Record::new(mutation.key.clone(), mutation.new_value.clone(), version, Origin::Local, now);
        entry.local = Some(LocalWrite { record, client_seq: mutation.client_seq });

        diff(&mutation.key, before.as_ref(), entry.current())
    }

    /// Applies the acknowledgment of a local write.
    ///
    /// If the write is still the visible one it becomes confirmed without a
    /// visible change. Otherwise the acknowledged value competes like any
    /// other remote record.
    pub fn apply_ack(
        &mut self,
        mutation: &PendingMutation,
        version: Version,
        source: Source,
    ) -> Outcome {
        let key = &mutation.key;
        // The write postdates any replay in flight for this source
        self.mark_seen(source, key);
        let pending = self.entries.get(key).is_some_and(|e| e.local.is_some());
        if !pending {
            return self.apply_confirmed(source, key.clone(), mutation.new_value.clone(), version);
        }

        let now = self.clock.now_utc();
        let entry = self.entries.entry(key.clone()).or_default();
        let before = entry.visible().cloned();
        let record = Record::new(key.clone(), mutation.new_value.clone(), version, Origin::Remote, now);

        let own = entry.local.as_ref().is_some_and(|l| l.client_seq == mutation.client_seq);
        if own {
            entry.local = None;
            entry.confirm(record, source);
        } else if !entry.confirm(record, source) {
            return Outcome::Stale;
        }
        diff(key, before.as_ref(), entry.current())
    }

    /// Undoes the optimistic write `client_seq` if it is still visible.
    pub fn rollback(&mut self, key: &RecordKey, client_seq: u64) -> Outcome {
        let Some(entry) = self.entries.get_mut(key) else {
            return Outcome::Stale;
        };
        if !entry.local.as_ref().is_some_and(|l| l.client_seq == client_seq) {
            return Outcome::Stale;
        }
        let Some(local) = entry.local.take() else {
            return Outcome::Stale;
        };

        let outcome = diff(key, Some(&local.record), entry.current());
        if entry.confirmed.is_none() {
            self.entries.remove(key);
        }
        outcome
    }

    /// Starts recording which keys `source` replays under `prefix`.
    pub fn begin_resync(&mut self, source: Source, prefix: KeyPrefix) {
        self.resyncs.insert((source, prefix), HashSet::new());
    }

    /// Ends a replay, removing keys confirmed by `source` under `prefix`
    /// that the replay did not mention.
    pub fn finish_resync(&mut self, source: Source, prefix: &KeyPrefix) -> Vec<Update> {
        let Some(seen) = self.resyncs.remove(&(source, prefix.clone())) else {
            return Vec::new();
        };
        let now = self.clock.now_utc();

        let mut updates = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if !prefix.matches(key) || seen.contains(key) {
                continue;
            }
            let before = entry.visible().cloned();
            let Some(confirmed) = &mut entry.confirmed else { continue };
            if confirmed.source != source || confirmed.record.is_tombstone() {
                continue;
            }
            let version = confirmed.record.version;
            confirmed.record = Record::new(key.clone(), Value::Null, version, Origin::Remote, now);
            if let Outcome::Applied(update) = diff(key, before.as_ref(), entry.current()) {
                updates.push(update);
            }
        }
        updates
    }

    /// The visible record for `key`, if any.
    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.entries.get(key).and_then(Entry::visible)
    }

    /// Every visible record under `prefix`, in key order.
    pub fn snapshot(&self, prefix: &KeyPrefix) -> Vec<Record> {
        self.entries
            .iter()
            .filter(|(key, _)| prefix.matches(key))
            .filter_map(|(_, entry)| entry.visible().cloned())
            .collect()
    }

    /// Number of keys with an unacknowledged local write.
    pub fn pending_local(&self) -> usize {
        self.entries.values().filter(|e| e.local.is_some()).count()
    }

    fn mark_seen(&mut self, source: Source, key: &RecordKey) {
        for ((s, prefix), seen) in self.resyncs.iter_mut() {
            if *s == source && prefix.matches(key) {
                seen.insert(key.clone());
            }
        }
    }

    fn apply_confirmed(
        &mut self,
        source: Source,
        key: RecordKey,
        value: Value,
        version: Version,
    ) -> Outcome {
        let now = self.clock.now_utc();
        let entry = self.entries.entry(key.clone()).or_default();
        let before = entry.visible().cloned();
        let record = Record::new(key.clone(), value, version, Origin::Remote, now);

        let wins = entry.current().map_or(true, |c| c.is_superseded_by(version, Origin::Remote));
        if !wins {
            // Hidden beneath a pending local write, but still the newest
            // server state to fall back to on rollback
            if entry.local.is_some() {
                entry.confirm(record, source);
            }
            return Outcome::Stale;
        }

        entry.local = None;
        entry.confirmed = Some(Confirmed { record, source });
        diff(&key, before.as_ref(), entry.current())
    }
}

/// Compares the visible value before a change with the record held after it.
fn diff(key: &RecordKey, before: Option<&Record>, after: Option<&Record>) -> Outcome {
    let before = before.filter(|r| !r.is_tombstone());
    let visible = after.filter(|r| !r.is_tombstone());
    let (kind, record) = match (before, visible) {
        (None, None) => return Outcome::Unchanged,
        (Some(b), Some(a)) if b.value == a.value => return Outcome::Unchanged,
        (None, Some(a)) => (EventKind::Added, a),
        (Some(_), Some(a)) => (EventKind::Changed, a),
        (Some(b), None) => (EventKind::Removed, after.unwrap_or(b)),
    };
    Outcome::Applied(Update {
        key: key.clone(),
        value: (kind != EventKind::Removed).then(|| record.value.clone()),
        version: record.version,
        origin: record.origin,
        kind,
    })
}

/// Input to the apply loop.
pub(crate) enum Ingest {
    Event { source: Source, event: StoreEvent },
    ResyncStarted { source: Source, prefix: KeyPrefix },
    ResyncFinished { source: Source, prefix: KeyPrefix },
    Local { mutation: PendingMutation },
    Acked { mutation: PendingMutation, version: Version, source: Source },
    Rollback { key: RecordKey, client_seq: u64 },
    Get { key: RecordKey, reply: oneshot::Sender<Option<Record>> },
    Snapshot { prefix: KeyPrefix, reply: oneshot::Sender<Vec<Record>> },
}

/// The apply loop: drains `rx` in order and dispatches every visible change.
pub(crate) async fn run<C: ClockSource>(
    mut reconciler: Reconciler<C>,
    mut rx: mpsc::UnboundedReceiver<Ingest>,
    registry: Arc<SubscriptionRegistry>,
    notices: broadcast::Sender<SyncNotice>,
    cancel: CancellationToken,
) {
    loop {
        let ingest = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            ingest = rx.recv() => match ingest {
                Some(ingest) => ingest,
                None => break,
            },
        };

        let outcome = match ingest {
            Ingest::Event { source, event } => {
                let key = event.key.clone();
                match reconciler.apply_remote(source, event) {
                    Ok(outcome) => outcome,
                    Err(reason) => {
                        warn!(%key, ?source, reason, "rejected event");
                        let _ = notices.send(SyncNotice::EventRejected {
                            key: Some(key),
                            reason: reason.to_string(),
                        });
                        continue;
                    }
                }
            }
            Ingest::ResyncStarted { source, prefix } => {
                debug!(%prefix, ?source, "resync started");
                reconciler.begin_resync(source, prefix);
                continue;
            }
            Ingest::ResyncFinished { source, prefix } => {
                let removed = reconciler.finish_resync(source, &prefix);
                debug!(%prefix, ?source, removed = removed.len(), "resync finished");
                for update in &removed {
                    registry.dispatch(update);
                }
                continue;
            }
            Ingest::Local { mutation } => reconciler.apply_local(&mutation),
            Ingest::Acked { mutation, version, source } => {
                reconciler.apply_ack(&mutation, version, source)
            }
            Ingest::Rollback { key, client_seq } => reconciler.rollback(&key, client_seq),
            Ingest::Get { key, reply } => {
                let _ = reply.send(reconciler.get(&key).cloned());
                continue;
            }
            Ingest::Snapshot { prefix, reply } => {
                let _ = reply.send(reconciler.snapshot(&prefix));
                continue;
            }
        };

        if let Outcome::Applied(update) = outcome {
            registry.dispatch(&update);
        }
    }
    debug!("reconciler stopped");
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
