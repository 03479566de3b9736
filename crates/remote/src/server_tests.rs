// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::*;
use crate::state::RelayOptions;
use lsync_core::{EventKind, RecordKey};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn key(path: &str) -> RecordKey {
    RecordKey::new(path).unwrap()
}

fn prefix(path: &str) -> KeyPrefix {
    KeyPrefix::new(path).unwrap()
}

/// A relay on a random port, stopped when dropped.
struct TestServer {
    addr: SocketAddr,
    state: RelayState,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(state: RelayState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn({
            let state = state.clone();
            async move {
                let _ = serve(listener, state).await;
            }
        });
        TestServer { addr, state, task }
    }

    async fn client(&self) -> TestClient {
        let (ws, _) = connect_async(format!("ws://{}", self.addr)).await.unwrap();
        let (sink, stream) = ws.split();
        TestClient { sink, stream }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct TestClient {
    sink: SplitSink<Ws, Message>,
    stream: SplitStream<Ws>,
}

impl TestClient {
    async fn send(&mut self, msg: ClientMessage) {
        self.sink.send(Message::Text(msg.to_json().unwrap().into())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return ServerMessage::from_json(text.as_str()).unwrap();
            }
        }
    }

    async fn assert_quiet(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(50), self.stream.next()).await;
        assert!(next.is_err(), "unexpected frame {next:?}");
    }

    fn write(seq: u64, path: &str, value: serde_json::Value) -> ClientMessage {
        ClientMessage::Write { client_id: "c1".into(), client_seq: seq, key: key(path), value }
    }
}

#[tokio::test]
async fn ping_pong() {
    let server = TestServer::start(RelayState::in_memory()).await;
    let mut client = server.client().await;

    client.send(ClientMessage::ping(42)).await;
    assert_eq!(client.recv().await, ServerMessage::pong(42));
}

#[tokio::test]
async fn subscribe_replays_then_marks_synced() {
    let server = TestServer::start(RelayState::in_memory()).await;
    server.state.apply_write("seed", 1, key("rooms/a"), json!("A")).await.unwrap();
    server.state.apply_write("seed", 2, key("lobby"), json!("L")).await.unwrap();

    let mut client = server.client().await;
    client.send(ClientMessage::subscribe(prefix("rooms"))).await;
    assert_eq!(
        client.recv().await,
        ServerMessage::event(StoreEvent::added(key("rooms/a"), json!("A"), 1))
    );
    assert_eq!(client.recv().await, ServerMessage::synced(prefix("rooms")));
    client.assert_quiet().await;
}

#[tokio::test]
async fn write_is_acked_and_echoed_to_subscribers() {
    let server = TestServer::start(RelayState::in_memory()).await;
    let mut writer = server.client().await;
    let mut reader = server.client().await;

    for client in [&mut writer, &mut reader] {
        client.send(ClientMessage::subscribe(prefix("notes"))).await;
        assert_eq!(client.recv().await, ServerMessage::synced(prefix("notes")));
    }

    writer.send(TestClient::write(1, "notes/a", json!("hi"))).await;
    assert_eq!(writer.recv().await, ServerMessage::ack(1, key("notes/a"), 1));
    let echo = ServerMessage::event(StoreEvent::added(key("notes/a"), json!("hi"), 1));
    assert_eq!(writer.recv().await, echo);
    assert_eq!(reader.recv().await, echo);

    writer.send(TestClient::write(2, "notes/a", serde_json::Value::Null)).await;
    assert_eq!(writer.recv().await, ServerMessage::ack(2, key("notes/a"), 2));
    match reader.recv().await {
        ServerMessage::Event(event) => assert_eq!(event.kind, EventKind::Removed),
        other => unreachable!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn retried_write_gets_the_original_ack() {
    let server = TestServer::start(RelayState::in_memory()).await;
    let mut client = server.client().await;

    client.send(TestClient::write(5, "k", json!(1))).await;
    assert_eq!(client.recv().await, ServerMessage::ack(5, key("k"), 1));
    client.send(TestClient::write(5, "k", json!(1))).await;
    assert_eq!(client.recv().await, ServerMessage::ack(5, key("k"), 1));
    assert_eq!(server.state.version().await, 1);
}

#[tokio::test]
async fn read_only_write_is_rejected() {
    let options = RelayOptions { data_dir: None, read_only: vec![prefix("locked")] };
    let server = TestServer::start(RelayState::open(&options).unwrap()).await;
    let mut client = server.client().await;

    client.send(TestClient::write(1, "locked/x", json!(1))).await;
    match client.recv().await {
        ServerMessage::Reject { client_seq, message } => {
            assert_eq!(client_seq, 1);
            assert!(message.contains("read-only"));
        }
        other => unreachable!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn malformed_message_gets_an_error_frame() {
    let server = TestServer::start(RelayState::in_memory()).await;
    let mut client = server.client().await;

    client.sink.send(Message::Text("{\"type\":\"bogus\"}".into())).await.unwrap();
    assert!(matches!(client.recv().await, ServerMessage::Error { .. }));

    // The connection stays usable
    client.send(ClientMessage::ping(1)).await;
    assert_eq!(client.recv().await, ServerMessage::pong(1));
}

#[tokio::test]
async fn unsubscribed_prefix_stops_receiving() {
    let server = TestServer::start(RelayState::in_memory()).await;
    let mut client = server.client().await;
    client.send(ClientMessage::subscribe(prefix("a"))).await;
    assert_eq!(client.recv().await, ServerMessage::synced(prefix("a")));
    client.send(ClientMessage::unsubscribe(prefix("a"))).await;
    client.send(ClientMessage::ping(9)).await;
    assert_eq!(client.recv().await, ServerMessage::pong(9));

    server.state.apply_write("other", 1, key("a/1"), json!(1)).await.unwrap();
    client.assert_quiet().await;
}

#[tokio::test]
async fn replayed_changes_are_not_sent_twice() {
    let state = RelayState::in_memory();
    let mut session = Session::default();
    state.apply_write("c", 1, key("p/x"), json!(1)).await.unwrap();

    let mut events = state.events();
    state.apply_write("c", 2, key("p/y"), json!(2)).await.unwrap();
    let replies = handle_client_message(
        &ClientMessage::subscribe(prefix("p")).to_json().unwrap(),
        &state,
        &mut session,
    )
    .await
    .unwrap();
    assert_eq!(replies.len(), 3);

    // Already covered by the replay
    let queued = events.recv().await.unwrap();
    assert!(!session.wants(&queued));

    state.apply_write("c", 3, key("p/x"), json!(3)).await.unwrap();
    assert!(session.wants(&events.recv().await.unwrap()));
    state.apply_write("c", 4, key("q/x"), json!(4)).await.unwrap();
    assert!(!session.wants(&events.recv().await.unwrap()));
}

#[tokio::test]
async fn hello_records_the_client() {
    let state = RelayState::in_memory();
    let mut session = Session::default();
    let replies = handle_client_message(
        &ClientMessage::hello("device-1").to_json().unwrap(),
        &state,
        &mut session,
    )
    .await
    .unwrap();
    assert!(replies.is_empty());
    assert_eq!(session.client_id.as_deref(), Some("device-1"));
}
