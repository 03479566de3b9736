// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for sync core tests.

#![allow(clippy::unwrap_used)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lsync_core::protocol::{ClientMessage, ServerMessage};
use lsync_core::{KeyPrefix, RecordKey};
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::transport::{Frame, Inbound, Transport, TransportError, TransportResult};

pub fn key(path: &str) -> RecordKey {
    RecordKey::new(path).unwrap()
}

pub fn prefix(path: &str) -> KeyPrefix {
    KeyPrefix::new(path).unwrap()
}

/// Config with millisecond backoff so retry paths finish quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        url: "ws://mock".into(),
        client_id: "test-client".into(),
        backoff_base_ms: 1,
        backoff_cap_ms: 5,
        max_reconnect_attempts: 3,
        outbox_max_attempts: 5,
        outbox_fanout: 4,
        ack_timeout_ms: 200,
        heartbeat_interval_ms: 0,
        ..SyncConfig::default()
    }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(check(), "timed out waiting for {what}");
}

#[derive(Default)]
struct MockState {
    connected: bool,
    refuse_connects: bool,
    connect_failures: u32,
    send_failures: u32,
    connect_delay: Duration,
    connects: u32,
    disconnects: u32,
    sent: Vec<Frame>,
}

/// Mock transport for testing without real sockets.
///
/// Inbound frames are scripted through the paired [`MockRemote`]; `recv`
/// waits for them like an idle socket would.
pub struct MockTransport {
    connected: bool,
    shared: Arc<Mutex<MockState>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Test-side control of a [`MockTransport`] that has moved into a task.
#[derive(Clone)]
pub struct MockRemote {
    shared: Arc<Mutex<MockState>>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MockTransport {
    pub fn new() -> (MockTransport, MockRemote) {
        let shared = Arc::new(Mutex::new(MockState::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = MockTransport { connected: false, shared: Arc::clone(&shared), inbound: rx };
        (transport, MockRemote { shared, inbound: tx })
    }
}

impl MockRemote {
    /// Every connect fails while set.
    pub fn refuse_connects(&self, refuse: bool) {
        self.shared.lock().unwrap().refuse_connects = refuse;
    }

    /// The next `n` connects fail.
    pub fn fail_connects(&self, n: u32) {
        self.shared.lock().unwrap().connect_failures = n;
    }

    /// Connects that would succeed take `delay` to do so.
    pub fn delay_connects(&self, delay: Duration) {
        self.shared.lock().unwrap().connect_delay = delay;
    }

    /// The next `n` sends fail and drop the session.
    pub fn fail_sends(&self, n: u32) {
        self.shared.lock().unwrap().send_failures = n;
    }

    pub fn push(&self, frame: Frame) {
        self.inbound.send(Inbound::Frame(frame)).unwrap();
    }

    pub fn push_message(&self, msg: &ServerMessage) {
        self.push(Frame::Text(msg.to_json().unwrap()));
    }

    /// Simulates the peer closing the session.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        self.inbound.send(Inbound::Closed { code, reason: reason.into() }).unwrap();
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.shared.lock().unwrap().sent.clone()
    }

    /// Sent text frames decoded as protocol messages.
    pub fn sent_messages(&self) -> Vec<ClientMessage> {
        self.sent()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => ClientMessage::from_json(text).ok(),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.shared.lock().unwrap().sent.clear();
    }

    pub fn connects(&self) -> u32 {
        self.shared.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.shared.lock().unwrap().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().connected
    }
}

impl Transport for MockTransport {
    fn connect(
        &mut self,
        _url: &str,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            let delay = {
                let mut state = self.shared.lock().unwrap();
                if state.refuse_connects || state.connect_failures > 0 {
                    state.connect_failures = state.connect_failures.saturating_sub(1);
                    return Err(TransportError::ConnectionFailed("mock failure".into()));
                }
                state.connect_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.shared.lock().unwrap();
            state.connected = true;
            state.connects += 1;
            self.connected = true;
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.shared.lock().unwrap();
            if self.connected {
                state.disconnects += 1;
            }
            state.connected = false;
            self.connected = false;
            Ok(())
        })
    }

    fn send(
        &mut self,
        frame: Frame,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.shared.lock().unwrap();
            if !self.connected {
                return Err(TransportError::ConnectionClosed);
            }
            if state.send_failures > 0 {
                state.send_failures -= 1;
                state.connected = false;
                self.connected = false;
                return Err(TransportError::SendFailed("mock send failure".into()));
            }
            state.sent.push(frame);
            Ok(())
        })
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = TransportResult<Inbound>> + Send + '_>> {
        Box::pin(async move {
            if !self.connected {
                return Err(TransportError::ConnectionClosed);
            }
            match self.inbound.recv().await {
                Some(Inbound::Closed { code, reason }) => {
                    self.connected = false;
                    self.shared.lock().unwrap().connected = false;
                    Ok(Inbound::Closed { code, reason })
                }
                Some(inbound) => Ok(inbound),
                None => std::future::pending().await,
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
