//! Minimal realtime server for integration testing
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use beacon_lib::{ChannelConfig, ConnectionState, RealtimeChannel};

/// Default wait for anything the server or channel should do
pub const WAIT: Duration = Duration::from_secs(5);

/// Accepts websocket clients on an ephemeral port
pub struct TestServer {
    /// Port the server listens on
    pub port: u16,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

/// One accepted client
pub struct ServerConnection {
    /// Authorization header sent with the handshake
    pub authorization: Option<String>,
    ws: WebSocketStream<TcpStream>,
}

impl TestServer {
    /// Bind and start accepting
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let captured = Arc::new(Mutex::new(None));
                    let sink = Arc::clone(&captured);
                    let callback =
                        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            *sink.lock().unwrap() = req
                                .headers()
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(String::from);
                            Ok(resp)
                        };

                    if let Ok(ws) = accept_hdr_async(stream, callback).await {
                        let authorization = captured.lock().unwrap().clone();
                        let _ = tx.send(ServerConnection { authorization, ws });
                    }
                });
            }
        });

        Ok(Self {
            port,
            connections: rx,
        })
    }

    /// Base address clients should be pointed at
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Channel config targeting this server
    pub fn config(&self) -> ChannelConfig {
        let mut config = ChannelConfig::new(self.url());
        config.transport.path = String::new();
        config.transport.reconnection_delay_ms = 50;
        config.transport.reconnection_delay_max_ms = 200;
        config.transport.timeout_ms = 2000;
        config
    }

    /// Wait for the next client
    pub async fn next_connection(&mut self) -> Result<ServerConnection> {
        timeout(WAIT, self.connections.recv())
            .await?
            .ok_or_else(|| anyhow!("server stopped accepting"))
    }
}

impl ServerConnection {
    /// Push an event to the client
    pub async fn send_event(&mut self, event: &str, data: Value) -> Result<()> {
        let frame = json!({"event": event, "data": data}).to_string();
        self.ws.send(Message::text(frame)).await?;
        Ok(())
    }

    /// Next JSON frame sent by the client
    pub async fn next_json(&mut self) -> Result<Value> {
        loop {
            match timeout(WAIT, self.ws.next()).await? {
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(text.as_str())?),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(anyhow!("client went away")),
            }
        }
    }

    /// Close the link from the server side
    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}

/// Wait until the channel reaches `target`
pub async fn wait_for_state(channel: &RealtimeChannel, target: ConnectionState) -> Result<()> {
    let mut changes = channel.state_changes();
    timeout(WAIT, changes.wait_for(|state| *state == target)).await??;
    Ok(())
}
