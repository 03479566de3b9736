// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket server implementation.
//!
//! Handles client connections, write acknowledgment, subscription replay
//! and event fanout.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use lsync_core::protocol::{ClientMessage, ServerMessage};
use lsync_core::{KeyPrefix, StoreEvent, Version};

use crate::state::{RelayState, WriteOutcome};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Run the relay on the given address.
pub async fn run(addr: SocketAddr, state: RelayState) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on: {}", listener.local_addr()?);
    serve(listener, state).await
}

/// Accept connections on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, state: RelayState) -> Result<(), BoxError> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

/// What one connection has announced and subscribed to.
#[derive(Debug, Default)]
pub(crate) struct Session {
    pub client_id: Option<String>,
    /// Subscribed prefixes and the version their replay was taken at.
    pub prefixes: BTreeMap<KeyPrefix, Version>,
}

impl Session {
    /// Whether `event` is news for this connection.
    pub fn wants(&self, event: &StoreEvent) -> bool {
        let version = event.version.unwrap_or(0);
        self.prefixes.iter().any(|(prefix, since)| prefix.matches(&event.key) && version > *since)
    }
}

/// Handle a single WebSocket connection.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: RelayState,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    info!("New WebSocket connection from: {}", peer_addr);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut events = state.events();
    let mut session = Session::default();

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} disconnected", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sink.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Client {} stream ended", peer_addr);
                        break;
                    }
                };

                let replies = match handle_client_message(&text, &state, &mut session).await {
                    Ok(replies) => replies,
                    Err(e) => vec![ServerMessage::error(e.to_string())],
                };
                for reply in replies {
                    ws_sink.send(Message::Text(reply.to_json()?.into())).await?;
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) if session.wants(&event) => {
                        let json = ServerMessage::event(event).to_json()?;
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            warn!("Failed to send event to {}: {}", peer_addr, e);
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        // The client resyncs every prefix when it reconnects
                        warn!("Client {} lagged by {} events, closing", peer_addr, n);
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    info!(client_id = ?session.client_id, "Connection closed: {}", peer_addr);
    Ok(())
}

/// Process a client message and return the replies for this connection.
pub(crate) async fn handle_client_message(
    text: &str,
    state: &RelayState,
    session: &mut Session,
) -> Result<Vec<ServerMessage>, BoxError> {
    let msg = ClientMessage::from_json(text)?;
    debug!("Received message: {:?}", msg);

    match msg {
        ClientMessage::Hello { client_id } => {
            info!(%client_id, "client announced");
            session.client_id = Some(client_id);
            Ok(Vec::new())
        }

        ClientMessage::Write { client_id, client_seq, key, value } => {
            let reply = match state.apply_write(&client_id, client_seq, key.clone(), value).await? {
                WriteOutcome::Applied(version) | WriteOutcome::Duplicate(version) => {
                    debug!(%client_id, client_seq, %key, version, "write acknowledged");
                    ServerMessage::ack(client_seq, key, version)
                }
                WriteOutcome::Refused(reason) => {
                    warn!(%client_id, client_seq, %key, %reason, "write refused");
                    ServerMessage::reject(client_seq, reason)
                }
            };
            Ok(vec![reply])
        }

        ClientMessage::Subscribe { prefix } => {
            let (replay, version) = state.replay(&prefix).await;
            debug!(%prefix, events = replay.len(), version, "subscription replay");
            session.prefixes.insert(prefix.clone(), version);

            let mut replies: Vec<ServerMessage> = replay.into_iter().map(ServerMessage::event).collect();
            replies.push(ServerMessage::synced(prefix));
            Ok(replies)
        }

        ClientMessage::Unsubscribe { prefix } => {
            session.prefixes.remove(&prefix);
            Ok(Vec::new())
        }

        ClientMessage::Ping { id } => {
            debug!("Ping received: {}", id);
            Ok(vec![ServerMessage::pong(id)])
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
