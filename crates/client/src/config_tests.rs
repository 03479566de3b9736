// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use tempfile::TempDir;
use yare::parameterized;

#[test]
fn empty_document_uses_defaults() {
    let config = SyncConfig::from_toml("").unwrap();
    assert_eq!(config.url, "ws://localhost:7890");
    assert_eq!(config.backoff_base_ms, 1_000);
    assert_eq!(config.backoff_cap_ms, 30_000);
    assert_eq!(config.max_reconnect_attempts, 10);
    assert_eq!(config.outbox_max_attempts, 5);
    assert_eq!(config.outbox_fanout, 4);
    assert_eq!(config.ack_timeout_ms, 10_000);
    assert_eq!(config.heartbeat_interval_ms, 30_000);
    assert_eq!(config.heartbeat_timeout_ms, 10_000);
    assert_eq!(config.write_route, WriteRoute::Transport);
    assert_eq!(config.outbox_path, None);
    assert_eq!(config.client_id.len(), lsync_core::push_id::PUSH_ID_LEN);
}

#[test]
fn default_client_ids_are_unique() {
    assert_ne!(SyncConfig::default().client_id, SyncConfig::default().client_id);
}

#[test]
fn parses_every_field() {
    let config = SyncConfig::from_toml(
        r#"
        url = "wss://relay.example.com/sync"
        client_id = "device-7"
        backoff_base_ms = 250
        backoff_cap_ms = 4000
        max_reconnect_attempts = 0
        outbox_max_attempts = 3
        outbox_fanout = 1
        ack_timeout_ms = 500
        heartbeat_interval_ms = 0
        write_route = "store"
        outbox_path = "/tmp/outbox.jsonl"
        "#,
    )
    .unwrap();

    assert_eq!(config.url, "wss://relay.example.com/sync");
    assert_eq!(config.client_id, "device-7");
    assert_eq!(config.max_reconnect_attempts, 0);
    assert_eq!(config.write_route, WriteRoute::Store);
    assert_eq!(config.outbox_path, Some(PathBuf::from("/tmp/outbox.jsonl")));
    assert_eq!(config.heartbeat(), None);
    assert_eq!(
        config.backoff(),
        BackoffPolicy::new(Duration::from_millis(250), Duration::from_millis(4000))
    );
}

#[parameterized(
    http_url = { "url = \"http://localhost\"", "ws://" },
    blank_client = { "client_id = \"  \"", "client_id" },
    zero_base = { "backoff_base_ms = 0", "backoff_base_ms" },
    cap_below_base = { "backoff_base_ms = 5000\nbackoff_cap_ms = 1000", "backoff_cap_ms" },
    single_attempt = { "outbox_max_attempts = 1", "outbox_max_attempts" },
    zero_fanout = { "outbox_fanout = 0", "outbox_fanout" },
    zero_ack_timeout = { "ack_timeout_ms = 0", "ack_timeout_ms" },
    zero_pong_timeout = { "heartbeat_timeout_ms = 0", "heartbeat_timeout_ms" },
)]
fn rejects_invalid_values(toml: &str, mentions: &str) {
    let err = SyncConfig::from_toml(toml).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    assert!(err.to_string().contains(mentions), "{err}");
}

#[test]
fn pong_timeout_is_ignored_when_heartbeat_disabled() {
    assert!(SyncConfig::from_toml("heartbeat_interval_ms = 0\nheartbeat_timeout_ms = 0").is_ok());
}

#[test]
fn unknown_route_fails_to_parse() {
    let err = SyncConfig::from_toml("write_route = \"carrier-pigeon\"").unwrap_err();
    assert!(err.to_string().contains("failed to parse config"));
}

#[test]
fn load_reads_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sync.toml");
    std::fs::write(&path, "url = \"ws://10.0.0.2:7890\"\nclient_id = \"a\"\n").unwrap();

    let config = SyncConfig::load(&path).unwrap();
    assert_eq!(config.url, "ws://10.0.0.2:7890");
    assert_eq!(config.client_id, "a");
}

#[test]
fn load_missing_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = SyncConfig::load(&dir.path().join("nope.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read config"));
}
