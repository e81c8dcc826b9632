//! Channel over the websocket transport against a local server
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;

use beacon_lib::{
    ChannelError, ConnectionState, RealtimeChannel, TokenData, TokenStore, WebSocketConnector,
};

use crate::test_server::{wait_for_state, TestServer, WAIT};

fn credentials(token: &str) -> Arc<TokenStore> {
    Arc::new(TokenStore::with_token(TokenData::new(
        token,
        Some(Utc::now() + chrono::Duration::hours(1)),
    )))
}

#[tokio::test]
async fn test_alert_delivered_over_websocket() -> Result<()> {
    let mut server = TestServer::start().await?;
    let channel = RealtimeChannel::new(
        server.config(),
        Arc::new(WebSocketConnector::new()),
        credentials("ws-token"),
    )?;

    let mut first = channel.subscribe("alert");
    let mut second = channel.subscribe("alert");

    let mut conn = server.next_connection().await?;
    assert_eq!(conn.authorization.as_deref(), Some("Bearer ws-token"));
    wait_for_state(&channel, ConnectionState::Connected).await?;

    conn.send_event("alert", json!({"id": 1})).await?;
    assert_eq!(timeout(WAIT, first.recv()).await?, Some(json!({"id": 1})));
    assert_eq!(timeout(WAIT, second.recv()).await?, Some(json!({"id": 1})));

    channel.teardown();
    assert_eq!(timeout(WAIT, first.recv()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_auth_payload_owns_authorization_header() -> Result<()> {
    let mut server = TestServer::start().await?;
    let mut config = server.config();
    config
        .transport
        .extra_headers
        .push(("Authorization".to_string(), "Bearer stale".to_string()));
    let channel = RealtimeChannel::new(
        config,
        Arc::new(WebSocketConnector::new()),
        credentials("ws-token"),
    )?;

    let _alerts = channel.subscribe("alert");
    let conn = server.next_connection().await?;
    assert_eq!(conn.authorization.as_deref(), Some("Bearer ws-token"));

    channel.teardown();
    Ok(())
}

#[tokio::test]
async fn test_emit_reaches_server() -> Result<()> {
    let mut server = TestServer::start().await?;
    let channel = RealtimeChannel::new(
        server.config(),
        Arc::new(WebSocketConnector::new()),
        credentials("ws-token"),
    )?;

    let _alerts = channel.subscribe("alert");
    let mut conn = server.next_connection().await?;
    wait_for_state(&channel, ConnectionState::Connected).await?;

    channel.emit("ack", json!({"id": 1}))?;
    let frame = conn.next_json().await?;
    assert_eq!(frame, json!({"event": "ack", "data": {"id": 1}}));
    Ok(())
}

#[tokio::test]
async fn test_server_close_is_reported() -> Result<()> {
    let mut server = TestServer::start().await?;
    let channel = RealtimeChannel::new(
        server.config(),
        Arc::new(WebSocketConnector::new()),
        credentials("ws-token"),
    )?;

    let _alerts = channel.subscribe("alert");
    let conn = server.next_connection().await?;
    wait_for_state(&channel, ConnectionState::Connected).await?;

    conn.close().await?;
    wait_for_state(&channel, ConnectionState::Disconnected).await?;
    assert!(matches!(
        channel.status().last_error,
        Some(ChannelError::ConnectionLost { .. })
    ));
    assert!(!channel.is_healthy());
    Ok(())
}

#[tokio::test]
async fn test_reconnect_after_server_close() -> Result<()> {
    let mut server = TestServer::start().await?;
    let channel = RealtimeChannel::new(
        server.config(),
        Arc::new(WebSocketConnector::new()),
        credentials("ws-token"),
    )?;

    let mut alerts = channel.subscribe("alert");
    let conn = server.next_connection().await?;
    wait_for_state(&channel, ConnectionState::Connected).await?;
    conn.close().await?;
    wait_for_state(&channel, ConnectionState::Disconnected).await?;

    channel.reconnect();
    let mut conn = server.next_connection().await?;
    wait_for_state(&channel, ConnectionState::Connected).await?;

    conn.send_event("alert", json!({"id": 2})).await?;
    assert_eq!(timeout(WAIT, alerts.recv()).await?, Some(json!({"id": 2})));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_server_records_handshake_error() -> Result<()> {
    // Grab a free port, then stop listening on it
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };

    let mut config = beacon_lib::ChannelConfig::new(format!("http://127.0.0.1:{}", port));
    config.transport.path = String::new();
    config.transport.reconnection = false;

    let channel = RealtimeChannel::new(
        config,
        Arc::new(WebSocketConnector::new()),
        credentials("ws-token"),
    )?;

    let _alerts = channel.subscribe("alert");
    assert_eq!(channel.state(), ConnectionState::Connecting);
    wait_for_state(&channel, ConnectionState::Disconnected).await?;

    assert!(matches!(
        channel.status().last_error,
        Some(ChannelError::Handshake { .. })
    ));
    Ok(())
}
