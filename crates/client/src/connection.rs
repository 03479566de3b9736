// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Background connection management.
//!
//! One task owns the [`Transport`] and therefore the only physical session.
//! Everything else talks to it through a cloneable [`ConnectionHandle`]:
//! commands go in over a channel, state transitions come out over a `watch`,
//! and inbound frames are fanned out over a `broadcast`.
//!
//! After an unexpected closure the task moves to [`ConnectionState::Backoff`]
//! and reconnects with jittered exponential delays until it succeeds or the
//! retry budget runs out. It then reports `ConnectionLost` and stays
//! disconnected until `connect()` is called again.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError, SyncNotice};
use crate::transport::{is_reconnectable, Frame, Inbound, Transport};

/// Frames buffered per subscriber before it starts missing them.
const FRAME_BUFFER: usize = 1024;

/// Observable state of the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A handshake is in progress.
    Connecting,
    Connected,
    /// Waiting to make reconnect attempt number `attempt`.
    Backoff { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

enum Command {
    Connect { reply: oneshot::Sender<Result<()>> },
    Close { reply: oneshot::Sender<()> },
    Reset { reason: String },
    Send { frame: Frame, reply: oneshot::Sender<Result<()>> },
}

/// Cloneable handle to the connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    sessions: watch::Receiver<u64>,
    frames: broadcast::Sender<Frame>,
    /// Cancelled when the connection task exits.
    stopped: CancellationToken,
}

impl ConnectionHandle {
    /// Establishes the session, closing any previous one first.
    ///
    /// A handshake failure is returned as [`SyncError::ConnectError`] while
    /// retries continue in the background. Calling this also resets an
    /// exhausted retry budget.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Closes the session and stops auto-reconnect until `connect()`.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Close { reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Drops a live session as if the peer had gone away, triggering reconnect.
    pub async fn reset(&self, reason: impl Into<String>) -> Result<()> {
        self.command(Command::Reset { reason: reason.into() }).await
    }

    /// Sends a frame on the live session.
    ///
    /// Fails fast with [`SyncError::NotConnected`] unless connected.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if !self.state().is_connected() {
            return Err(SyncError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { frame, reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver of every state transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// A receiver that changes once per successfully opened session.
    pub(crate) fn sessions(&self) -> watch::Receiver<u64> {
        self.sessions.clone()
    }

    /// A fresh stream of inbound frames.
    ///
    /// The stream survives reconnects and ends only when the connection
    /// task shuts down. Each call starts at the current position.
    pub fn frames(&self) -> FrameStream {
        FrameStream { rx: self.frames.subscribe(), stopped: self.stopped.clone(), missed: 0 }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| SyncError::Shutdown)
    }
}

/// Lazy sequence of inbound frames.
pub struct FrameStream {
    rx: broadcast::Receiver<Frame>,
    stopped: CancellationToken,
    missed: u64,
}

impl FrameStream {
    /// The next frame, or `None` once the connection task is gone.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            let received = tokio::select! {
                biased;
                received = self.rx.recv() => received,
                _ = self.stopped.cancelled() => return None,
            };
            match received {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("frame subscriber lagged by {} frames", n);
                    self.missed += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Frames skipped because this subscriber fell behind, since last asked.
    pub fn take_missed(&mut self) -> u64 {
        std::mem::take(&mut self.missed)
    }
}

const CLOSED_MID_HANDSHAKE: &str = "closed before the handshake finished";

/// How an attempt to open a session ended.
enum Handshake {
    Opened,
    Failed(String),
    /// `close()` arrived first; no session was opened.
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Idle,
    Live,
    Retry { attempt: u32, at: Instant },
}

struct Connection<T: Transport> {
    transport: T,
    url: String,
    policy: BackoffPolicy,
    /// Automatic attempts allowed after a loss (0 = unlimited).
    max_attempts: u32,
    mode: Mode,
    state: watch::Sender<ConnectionState>,
    sessions: watch::Sender<u64>,
    frames: broadcast::Sender<Frame>,
    notices: broadcast::Sender<SyncNotice>,
    _stopped: DropGuard,
}

/// Spawns the connection task. It does not connect until asked to.
pub fn spawn<T: Transport>(
    transport: T,
    config: &SyncConfig,
    notices: broadcast::Sender<SyncNotice>,
    cancel: CancellationToken,
) -> (ConnectionHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (sessions_tx, sessions_rx) = watch::channel(0);
    let (frames_tx, _) = broadcast::channel(FRAME_BUFFER);
    let stopped = CancellationToken::new();

    let handle = ConnectionHandle {
        commands: commands_tx,
        state: state_rx,
        sessions: sessions_rx,
        frames: frames_tx.clone(),
        stopped: stopped.clone(),
    };

    let connection = Connection {
        transport,
        url: config.url.clone(),
        policy: config.backoff(),
        max_attempts: config.max_reconnect_attempts,
        mode: Mode::Idle,
        state: state_tx,
        sessions: sessions_tx,
        frames: frames_tx,
        notices,
        _stopped: stopped.drop_guard(),
    };

    let task = tokio::spawn(connection.run(commands_rx, cancel));
    (handle, task)
}

impl<T: Transport> Connection<T> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            match self.mode {
                Mode::Idle => tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(command) => self.handle(command, &mut commands, &cancel).await,
                        None => break,
                    },
                },
                Mode::Live => tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(command) => self.handle(command, &mut commands, &cancel).await,
                        None => break,
                    },
                    inbound = self.transport.recv() => match inbound {
                        Ok(Inbound::Frame(frame)) => {
                            // No subscribers is fine; frames are not buffered for later
                            let _ = self.frames.send(frame);
                        }
                        Ok(Inbound::Closed { code, reason }) => self.on_closed(code, reason).await,
                        Err(e) => {
                            warn!("receive failed: {}", e);
                            self.lose_session(e.to_string()).await;
                        }
                    },
                },
                Mode::Retry { attempt, at } => tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(command) => self.handle(command, &mut commands, &cancel).await,
                        None => break,
                    },
                    _ = tokio::time::sleep_until(at) => {
                        self.set_state(ConnectionState::Connecting);
                        match self.open(&mut commands, &cancel).await {
                            Handshake::Opened => {
                                info!("reconnected to {} after {} attempts", self.url, attempt);
                            }
                            Handshake::Failed(reason) => {
                                debug!("reconnect attempt {} failed: {}", attempt, reason);
                                self.schedule_retry(attempt + 1, reason);
                            }
                            Handshake::Closed => {}
                        }
                    }
                },
            }
        }

        let _ = self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        debug!("connection task stopped");
    }

    async fn handle(
        &mut self,
        command: Command,
        commands: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
    ) {
        match command {
            Command::Connect { reply } => {
                if matches!(self.mode, Mode::Live) && self.transport.is_connected() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.set_state(ConnectionState::Connecting);
                let result = match self.open(commands, cancel).await {
                    Handshake::Opened => {
                        info!("connected to {}", self.url);
                        Ok(())
                    }
                    Handshake::Failed(reason) => {
                        warn!("connect to {} failed: {}", self.url, reason);
                        self.schedule_retry(1, reason.clone());
                        Err(SyncError::ConnectError(reason))
                    }
                    Handshake::Closed => Err(SyncError::ConnectError(CLOSED_MID_HANDSHAKE.into())),
                };
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.close_session().await;
                let _ = reply.send(());
            }
            Command::Reset { reason } => {
                if matches!(self.mode, Mode::Live) {
                    warn!("resetting connection: {}", reason);
                    self.lose_session(reason).await;
                }
            }
            Command::Send { frame, reply } => {
                if !matches!(self.mode, Mode::Live) || !self.transport.is_connected() {
                    let _ = reply.send(Err(SyncError::NotConnected));
                    return;
                }
                match self.transport.send(frame).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        warn!("send failed: {}", e);
                        let reason = e.to_string();
                        let _ = reply.send(Err(SyncError::Transport(e)));
                        self.lose_session(reason).await;
                    }
                }
            }
        }
    }

    /// Opens a new session. The previous one, if any, is closed first.
    ///
    /// Commands are still served during the handshake. A `close()` abandons
    /// it before any session opens.
    async fn open(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
    ) -> Handshake {
        if self.transport.is_connected() {
            let _ = self.transport.disconnect().await;
        }

        let mut waiting = Vec::new();
        let ended = {
            let mut connect = self.transport.connect(&self.url);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break Err(None),
                    result = &mut connect => break Ok(result),
                    command = commands.recv() => match command {
                        Some(Command::Close { reply }) => break Err(Some(reply)),
                        Some(Command::Connect { reply }) => waiting.push(reply),
                        Some(Command::Send { reply, .. }) => {
                            let _ = reply.send(Err(SyncError::NotConnected));
                        }
                        Some(Command::Reset { .. }) => {}
                        None => break Err(None),
                    },
                }
            }
        };

        let handshake = match ended {
            Ok(Ok(())) => {
                self.mode = Mode::Live;
                self.sessions.send_modify(|n| *n += 1);
                self.set_state(ConnectionState::Connected);
                Handshake::Opened
            }
            Ok(Err(e)) => Handshake::Failed(e.to_string()),
            Err(None) => Handshake::Failed("shutting down".to_string()),
            Err(Some(reply)) => {
                self.close_session().await;
                let _ = reply.send(());
                Handshake::Closed
            }
        };

        for reply in waiting {
            let _ = reply.send(match &handshake {
                Handshake::Opened => Ok(()),
                Handshake::Failed(reason) => Err(SyncError::ConnectError(reason.clone())),
                Handshake::Closed => Err(SyncError::ConnectError(CLOSED_MID_HANDSHAKE.into())),
            });
        }
        handshake
    }

    /// Drops the session at the caller's request and stops reconnecting.
    async fn close_session(&mut self) {
        let _ = self.transport.disconnect().await;
        self.mode = Mode::Idle;
        self.set_state(ConnectionState::Disconnected);
        info!("connection closed by caller");
    }

    async fn on_closed(&mut self, code: Option<u16>, reason: String) {
        if is_reconnectable(code) {
            info!("session closed (code {:?}): {}", code, reason);
            self.lose_session(reason).await;
            return;
        }

        warn!("session closed with code {:?}, not reconnecting: {}", code, reason);
        let _ = self.transport.disconnect().await;
        self.mode = Mode::Idle;
        self.set_state(ConnectionState::Disconnected);
        let _ = self.notices.send(SyncNotice::ConnectionLost {
            attempts: 0,
            reason: format!("closed with code {}: {}", code.unwrap_or_default(), reason),
        });
    }

    /// An unexpected loss of the live session: start the reconnect cycle.
    async fn lose_session(&mut self, reason: String) {
        let _ = self.transport.disconnect().await;
        self.schedule_retry(1, reason);
    }

    fn schedule_retry(&mut self, attempt: u32, reason: String) {
        if self.max_attempts > 0 && attempt > self.max_attempts {
            let attempts = self.max_attempts;
            warn!("giving up after {} reconnect attempts: {}", attempts, reason);
            self.mode = Mode::Idle;
            self.set_state(ConnectionState::Disconnected);
            let _ = self.notices.send(SyncNotice::ConnectionLost { attempts, reason });
            return;
        }

        let delay = self.policy.jittered(attempt);
        debug!("reconnect attempt {} in {:?}", attempt, delay);
        self.mode = Mode::Retry { attempt, at: Instant::now() + delay };
        self.set_state(ConnectionState::Backoff { attempt });
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("connection state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
