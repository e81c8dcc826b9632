//! Connection lifecycle tests: disconnects, reconnects, teardown

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::timeout;

use super::channel_test::{channel, valid_credentials};
use crate::{
    ChannelError, ConnectionState, DisconnectReason, LoopbackConnector, TokenData, TransportKind,
    Transport,
};

#[tokio::test]
async fn test_teardown_completes_streams() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let channel = channel(&connector, &valid_credentials());

    let mut alerts = channel.subscribe("alert");
    let mut other = alerts.clone();
    let handle = connector.latest().unwrap();

    channel.teardown();

    assert_eq!(timeout(Duration::from_secs(1), alerts.recv()).await.unwrap(), None);
    assert_eq!(timeout(Duration::from_secs(1), other.recv()).await.unwrap(), None);
    assert!(handle.is_closed());
    assert!(!handle.has_lifecycle_handler());
    assert_eq!(handle.listener_count("alert"), 0);
    assert_eq!(channel.state(), ConnectionState::Disconnected);

    let status = channel.status();
    assert!(status.events.is_empty());
    assert_eq!(status.pending, 0);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_subscribe_after_teardown_starts_fresh() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let channel = channel(&connector, &valid_credentials());

    let _alerts = channel.subscribe("alert");
    channel.teardown();

    let mut alerts = channel.subscribe("alert");
    assert_eq!(connector.created_count(), 2);

    let handles = connector.handles();
    assert_eq!(handles[0].listener_count("alert"), 0);
    assert_eq!(handles[1].listener_count("alert"), 1);

    handles[1].push("alert", json!("again"));
    let payload = timeout(Duration::from_secs(1), alerts.recv()).await.unwrap();
    assert_eq!(payload, Some(json!("again")));
}

#[test]
fn test_teardown_is_idempotent() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let channel = channel(&connector, &valid_credentials());

    channel.teardown();
    channel.teardown();

    let _alerts = channel.subscribe("alert");
    channel.teardown();
    channel.teardown();
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_drop_tears_down() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let channel = channel(&connector, &valid_credentials());

    let mut alerts = channel.subscribe("alert");
    let handle = connector.latest().unwrap();
    drop(channel);

    assert_eq!(timeout(Duration::from_secs(1), alerts.recv()).await.unwrap(), None);
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_transport_reconnect_keeps_single_listener() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let channel = channel(&connector, &valid_credentials());

    let mut alerts = channel.subscribe("alert");
    let handle = connector.latest().unwrap();

    handle.drop_connection(DisconnectReason::TransportError("reset by peer".into()));
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert!(matches!(
        channel.status().last_error,
        Some(ChannelError::ConnectionLost { .. })
    ));
    assert!(!channel.is_healthy());

    // The transport's own backoff brings the same handle back
    handle.complete_handshake();
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(handle.listener_count("alert"), 1);
    assert!(channel.status().last_error.is_none());
    assert_eq!(connector.created_count(), 1);

    assert_eq!(handle.push("alert", json!({"id": 2})), 1);
    let payload = timeout(Duration::from_secs(1), alerts.recv()).await.unwrap();
    assert_eq!(payload, Some(json!({"id": 2})));
    assert!(timeout(Duration::from_millis(50), alerts.recv()).await.is_err());
}

#[tokio::test]
async fn test_explicit_reconnect_replaces_handle() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let channel = channel(&connector, &valid_credentials());

    let mut alerts = channel.subscribe("alert");
    let _status = channel.subscribe("status");
    let old = connector.latest().unwrap();

    old.drop_connection(DisconnectReason::PingTimeout);
    channel.reconnect();

    assert_eq!(connector.created_count(), 2);
    let new = connector.latest().unwrap();
    assert!(old.is_closed());
    assert_eq!(old.listener_count("alert"), 0);
    assert_eq!(new.listener_count("alert"), 1);
    assert_eq!(new.listener_count("status"), 1);
    assert!(channel.is_healthy());

    new.push("alert", json!({"id": 3}));
    let payload = timeout(Duration::from_secs(1), alerts.recv()).await.unwrap();
    assert_eq!(payload, Some(json!({"id": 3})));
    assert!(timeout(Duration::from_millis(50), alerts.recv()).await.is_err());
}

#[test]
fn test_reconnect_while_connected_is_noop() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let channel = channel(&connector, &valid_credentials());

    let _alerts = channel.subscribe("alert");
    channel.reconnect();
    channel.reconnect();

    assert_eq!(connector.created_count(), 1);
}

#[test]
fn test_reconnect_reads_credential_fresh() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let credentials = valid_credentials();
    let channel = channel(&connector, &credentials);

    let _alerts = channel.subscribe("alert");
    connector
        .latest()
        .unwrap()
        .drop_connection(DisconnectReason::PingTimeout);

    credentials.set(TokenData::new("token-2", None));
    channel.reconnect();

    let handles = connector.handles();
    assert_eq!(handles[0].options().auth.as_ref().unwrap().token, "token-1");
    assert_eq!(handles[1].options().auth.as_ref().unwrap().token, "token-2");
}

#[test]
fn test_server_close_with_expired_credential_stays_down() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let credentials = valid_credentials();
    let channel = channel(&connector, &credentials);

    let _alerts = channel.subscribe("alert");
    let handle = connector.latest().unwrap();

    credentials.set(TokenData::new(
        "token-1",
        Some(Utc::now() - chrono::Duration::seconds(1)),
    ));
    handle.drop_connection(DisconnectReason::ServerClosed);

    assert!(handle.is_closed());
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert!(matches!(
        channel.status().last_error,
        Some(ChannelError::CredentialExpired { .. })
    ));

    // A late reconnect from the retired handle changes nothing
    handle.complete_handshake();
    assert_eq!(channel.state(), ConnectionState::Disconnected);

    // Still refused until the credential is refreshed
    channel.reconnect();
    assert_eq!(connector.created_count(), 1);

    credentials.set(TokenData::new("token-3", None));
    channel.reconnect();
    assert_eq!(connector.created_count(), 2);
    assert_eq!(connector.latest().unwrap().listener_count("alert"), 1);
}

#[test]
fn test_ping_timeout_with_expired_credential_is_left_to_transport() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let credentials = valid_credentials();
    let channel = channel(&connector, &credentials);

    let _alerts = channel.subscribe("alert");
    let handle = connector.latest().unwrap();

    credentials.set(TokenData::new(
        "token-1",
        Some(Utc::now() - chrono::Duration::seconds(1)),
    ));
    handle.drop_connection(DisconnectReason::PingTimeout);

    assert!(!handle.is_closed());
    assert!(matches!(
        channel.status().last_error,
        Some(ChannelError::ConnectionLost { .. })
    ));
}

#[test]
fn test_handshake_failure_clears_gate() {
    let connector = Arc::new(LoopbackConnector::new());
    let channel = channel(&connector, &valid_credentials());

    let _alerts = channel.subscribe("alert");
    let first = connector.latest().unwrap();
    first.fail_handshake("connection refused");

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(
        channel.status().last_error,
        Some(ChannelError::handshake("connection refused", TransportKind::WebSocket))
    );

    // A new attempt is allowed and tears the failed handle down first
    channel.ensure_connected();
    assert_eq!(connector.created_count(), 2);
    assert!(first.is_closed());

    connector.latest().unwrap().complete_handshake();
    assert_eq!(connector.latest().unwrap().listener_count("alert"), 1);
}

#[test]
fn test_auth_failure_with_expired_credential() {
    let connector = Arc::new(LoopbackConnector::new());
    let credentials = valid_credentials();
    let channel = channel(&connector, &credentials);

    let _alerts = channel.subscribe("alert");
    credentials.set(TokenData::new(
        "token-1",
        Some(Utc::now() - chrono::Duration::seconds(1)),
    ));
    connector.latest().unwrap().fail_handshake("401 Unauthorized");

    assert!(matches!(
        channel.status().last_error,
        Some(ChannelError::CredentialExpired { .. })
    ));
}

#[test]
fn test_superseded_handle_is_ignored() {
    let connector = Arc::new(LoopbackConnector::new());
    let channel = channel(&connector, &valid_credentials());

    let _alerts = channel.subscribe("alert");
    let first = connector.latest().unwrap();
    first.fail_handshake("timeout");
    channel.ensure_connected();

    // The replaced handle can no longer move the state machine
    first.complete_handshake();
    first.drop_connection(DisconnectReason::TransportClosed);
    assert_eq!(channel.state(), ConnectionState::Connecting);
    assert_eq!(first.listener_count("alert"), 0);
}

#[tokio::test]
async fn test_state_changes_are_published() {
    let connector = Arc::new(LoopbackConnector::new());
    let channel = channel(&connector, &valid_credentials());
    let mut changes = channel.state_changes();
    assert_eq!(*changes.borrow(), ConnectionState::Disconnected);

    let _alerts = channel.subscribe("alert");
    assert!(changes.has_changed().unwrap());
    assert_eq!(*changes.borrow_and_update(), ConnectionState::Connecting);

    connector.latest().unwrap().complete_handshake();
    timeout(Duration::from_secs(1), changes.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*changes.borrow_and_update(), ConnectionState::Connected);

    channel.teardown();
    assert_eq!(*changes.borrow_and_update(), ConnectionState::Disconnected);
}

#[test]
fn test_status_when_healthy() {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let channel = channel(&connector, &valid_credentials());

    let _alerts = channel.subscribe("alert");
    let status = channel.status();

    assert!(channel.is_healthy());
    assert_eq!(status.state, ConnectionState::Connected);
    assert!(status.connected);
    assert!(status.credential_valid);
    assert!(!status.credential_expired);
    assert!(status.time_until_expiry_secs.unwrap() > 3500);
    assert_eq!(status.events, vec!["alert"]);

    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["state"], json!("connected"));
}
