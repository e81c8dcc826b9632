//! Channel lifecycle through the public API, driven by the loopback transport
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use tokio::time::timeout;

use beacon_lib::{
    ChannelConfig, ConnectionState, DisconnectReason, LoopbackConnector, RealtimeChannel,
    TokenData, TokenStore, Transport,
};

use crate::test_server::WAIT;

#[tokio::test]
async fn test_consumers_share_one_listener_across_reconnects() -> Result<()> {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let credentials = Arc::new(TokenStore::with_token(TokenData::new("token", None)));
    let channel = Arc::new(RealtimeChannel::new(
        ChannelConfig::new("http://localhost:3000"),
        connector.clone(),
        credentials,
    )?);

    // Two independent consumer tasks
    let mut consumers = Vec::new();
    for _ in 0..2 {
        let mut stream = channel.subscribe("alert");
        consumers.push(tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(payload) = stream.next().await {
                received.push(payload);
            }
            received
        }));
    }

    let first = connector.latest().expect("handle created");
    first.push("alert", json!({"id": 1}));

    // Lose the link, reconnect explicitly, deliver again
    first.drop_connection(DisconnectReason::TransportClosed);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    channel.reconnect();
    let second = connector.latest().expect("handle recreated");
    assert_eq!(second.listener_count("alert"), 1);
    second.push("alert", json!({"id": 2}));

    // Give the consumer tasks a turn before completing their streams
    tokio::task::yield_now().await;
    channel.teardown();

    for consumer in consumers {
        let received = timeout(WAIT, consumer).await??;
        assert_eq!(received, vec![json!({"id": 1}), json!({"id": 2})]);
    }
    Ok(())
}

#[tokio::test]
async fn test_logout_blocks_reconnect() -> Result<()> {
    let connector = Arc::new(LoopbackConnector::auto_connect());
    let credentials = Arc::new(TokenStore::with_token(TokenData::new("token", None)));
    let channel = RealtimeChannel::new(
        ChannelConfig::new("http://localhost:3000"),
        connector.clone(),
        credentials.clone(),
    )?;

    let _alerts = channel.subscribe("alert");
    connector
        .latest()
        .expect("handle created")
        .drop_connection(DisconnectReason::PingTimeout);

    credentials.clear();
    channel.reconnect();

    assert_eq!(connector.created_count(), 1);
    assert!(!channel.status().credential_valid);
    assert!(!channel.is_healthy());
    Ok(())
}
