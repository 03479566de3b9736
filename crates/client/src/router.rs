// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound frame routing and session upkeep.
//!
//! Decodes relay frames: acknowledgments go to the waiting senders, events
//! and replay markers go to the reconciler. On every new session it
//! re-announces the client and resubscribes, which the relay answers with
//! a full replay. While connected it pings on an interval and resets the
//! session when a ping goes unanswered.

use std::collections::BTreeSet;
use std::time::Duration;

use lsync_core::protocol::{ClientMessage, ServerMessage};
use lsync_core::KeyPrefix;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::{ConnectionHandle, ConnectionState, FrameStream};
use crate::error::SyncNotice;
use crate::reconciler::{Ingest, Source};
use crate::sender::{AckRouter, SendError};
use crate::store::WriteAck;
use crate::transport::Frame;

enum Command {
    Subscribe(KeyPrefix),
    Unsubscribe(KeyPrefix),
}

/// Handle for managing transport subscriptions.
#[derive(Clone)]
pub(crate) struct RouterHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RouterHandle {
    pub fn subscribe(&self, prefix: KeyPrefix) {
        let _ = self.commands.send(Command::Subscribe(prefix));
    }

    pub fn unsubscribe(&self, prefix: KeyPrefix) {
        let _ = self.commands.send(Command::Unsubscribe(prefix));
    }
}

pub(crate) fn spawn(
    connection: ConnectionHandle,
    acks: AckRouter,
    ingest: mpsc::UnboundedSender<Ingest>,
    notices: broadcast::Sender<SyncNotice>,
    config: &SyncConfig,
    cancel: CancellationToken,
) -> (RouterHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let router = Router {
        frames: connection.frames(),
        sessions: connection.sessions(),
        state: connection.watch(),
        connection,
        acks,
        ingest,
        notices,
        client_id: config.client_id.clone(),
        prefixes: BTreeSet::new(),
        heartbeat: config.heartbeat(),
        next_ping_at: None,
        awaiting_pong: None,
        ping_id: 0,
    };
    let task = tokio::spawn(router.run(commands_rx, cancel));
    (RouterHandle { commands: commands_tx }, task)
}

struct Router {
    connection: ConnectionHandle,
    frames: FrameStream,
    sessions: watch::Receiver<u64>,
    state: watch::Receiver<ConnectionState>,
    acks: AckRouter,
    ingest: mpsc::UnboundedSender<Ingest>,
    notices: broadcast::Sender<SyncNotice>,
    client_id: String,
    prefixes: BTreeSet<KeyPrefix>,
    /// Ping interval and pong timeout.
    heartbeat: Option<(Duration, Duration)>,
    next_ping_at: Option<Instant>,
    /// Deadline for the outstanding ping.
    awaiting_pong: Option<Instant>,
    ping_id: u64,
}

impl Router {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        loop {
            let deadline = match (self.next_ping_at, self.awaiting_pong) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                _ = cancel.cancelled() => break,

                frame = self.frames.next() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => break,
                },

                changed = self.sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.on_session().await;
                }

                changed = self.state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.on_state();
                }

                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_heartbeat().await;
                }
            }
        }
        debug!("router stopped");
    }

    async fn on_session(&mut self) {
        let session = *self.sessions.borrow_and_update();
        info!(session, "session opened, resubscribing");
        // Writes in flight on the previous session will never be acked there
        self.acks.fail_all(SendError::NotConnected);
        self.awaiting_pong = None;
        self.next_ping_at = self.heartbeat.map(|(interval, _)| Instant::now() + interval);

        self.send(ClientMessage::hello(self.client_id.clone())).await;
        for prefix in self.prefixes.clone() {
            self.resubscribe(prefix).await;
        }
    }

    fn on_state(&mut self) {
        let state = *self.state.borrow_and_update();
        if !state.is_connected() {
            self.acks.fail_all(SendError::NotConnected);
            self.awaiting_pong = None;
            self.next_ping_at = None;
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(prefix) => {
                if self.prefixes.insert(prefix.clone()) && self.connection.state().is_connected() {
                    self.resubscribe(prefix).await;
                }
            }
            Command::Unsubscribe(prefix) => {
                if self.prefixes.remove(&prefix) && self.connection.state().is_connected() {
                    self.send(ClientMessage::unsubscribe(prefix)).await;
                }
            }
        }
    }

    async fn resubscribe(&mut self, prefix: KeyPrefix) {
        let _ = self
            .ingest
            .send(Ingest::ResyncStarted { source: Source::Transport, prefix: prefix.clone() });
        self.send(ClientMessage::subscribe(prefix)).await;
    }

    async fn on_frame(&mut self, frame: Frame) {
        let missed = self.frames.take_missed();
        if missed > 0 {
            warn!(missed, "dropped inbound frames, forcing resync");
            let _ = self.connection.reset("frame stream lagged").await;
        }

        // Any traffic proves the session is alive
        self.awaiting_pong = None;

        let decoded = match &frame {
            Frame::Text(text) => ServerMessage::from_json(text),
            Frame::Binary(bytes) => serde_json::from_slice(bytes),
        };
        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed frame");
                let _ = self
                    .notices
                    .send(SyncNotice::EventRejected { key: None, reason: format!("malformed frame: {e}") });
                return;
            }
        };

        match msg {
            ServerMessage::Ack { client_seq, key, version } => {
                self.acks.resolve(client_seq, Ok(WriteAck { key, version }));
            }
            ServerMessage::Reject { client_seq, message } => {
                self.acks.resolve(client_seq, Err(SendError::Rejected(message)));
            }
            ServerMessage::Event(event) => {
                let _ = self.ingest.send(Ingest::Event { source: Source::Transport, event });
            }
            ServerMessage::Synced { prefix } => {
                let _ = self.ingest.send(Ingest::ResyncFinished { source: Source::Transport, prefix });
            }
            ServerMessage::Pong { id } => debug!(id, "pong"),
            ServerMessage::Error { message } => warn!(%message, "relay reported an error"),
        }
    }

    async fn on_heartbeat(&mut self) {
        let Some((interval, timeout)) = self.heartbeat else {
            return;
        };
        let now = Instant::now();

        if self.awaiting_pong.is_some_and(|deadline| now >= deadline) {
            warn!(?timeout, "heartbeat timeout, resetting session");
            self.awaiting_pong = None;
            self.next_ping_at = None;
            let _ = self.connection.reset("heartbeat timeout").await;
            return;
        }

        if self.next_ping_at.is_some_and(|at| now >= at) {
            if self.awaiting_pong.is_none() {
                self.ping_id += 1;
                self.awaiting_pong = Some(now + timeout);
                self.send(ClientMessage::ping(self.ping_id)).await;
            }
            self.next_ping_at = Some(now + interval);
        }
    }

    async fn send(&self, msg: ClientMessage) {
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode message");
                return;
            }
        };
        if let Err(e) = self.connection.send(Frame::Text(text)).await {
            debug!(error = %e, "send dropped");
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
