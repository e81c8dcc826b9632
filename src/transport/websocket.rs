//! Websocket transport
//!
//! Frames every message as a JSON text frame `{"event": <name>, "data": <payload>}`.
//! The bearer token rides on the upgrade request. Connection attempts and
//! recoverable drops are retried with the bounded backoff from [`crate::retry`];
//! a server close frame is final.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::{
    endpoint_url, DisconnectReason, EventHandler, LifecycleHandler, ListenerTable, Transport,
    TransportConnector, TransportKind, TransportOptions, TransportSignal,
};
use crate::error::{ChannelError, ChannelResult};
use crate::retry::{reconnect_schedule, with_backoff};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire envelope for every message in both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name
    pub event: String,
    /// Event payload
    #[serde(default)]
    pub data: Value,
}

/// Connector for [`WebSocketTransport`]
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new connector
    pub fn new() -> Self {
        Self
    }
}

impl TransportConnector for WebSocketConnector {
    fn create(&self, url: &str, options: &TransportOptions) -> ChannelResult<Arc<dyn Transport>> {
        if !options.transports.contains(&TransportKind::WebSocket) {
            return Err(ChannelError::handshake(
                "no supported transport in the allowed list",
                options.primary_kind(),
            ));
        }
        for kind in options.transports.iter().filter(|k| **k != TransportKind::WebSocket) {
            debug!(transport = %kind, "Skipping unsupported transport kind");
        }

        let target = websocket_url(url, &options.path)?;
        Ok(Arc::new(WebSocketTransport::new(target, options.clone())))
    }
}

/// Map an http(s) or ws(s) base address plus path to a websocket URL
pub fn websocket_url(base: &str, path: &str) -> ChannelResult<String> {
    let url = endpoint_url(base, path);
    if let Some(rest) = url.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = url.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(url)
    } else {
        Err(ChannelError::handshake(
            format!("unsupported address scheme: {}", url),
            TransportKind::WebSocket,
        ))
    }
}

/// State shared between the handle and its connection task
struct Shared {
    id: Uuid,
    url: String,
    options: TransportOptions,
    listeners: ListenerTable,
    lifecycle: Mutex<Option<LifecycleHandler>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn lifecycle_handler(&self) -> Option<LifecycleHandler> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Deliver a signal unless the handle has been closed
    fn signal(&self, signal: TransportSignal) {
        if self.closed.load(Ordering::SeqCst) {
            trace!(id = %self.id, ?signal, "Suppressing signal from closed transport");
            return;
        }
        if let Some(handler) = self.lifecycle_handler() {
            handler(signal);
        }
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => {
                let delivered = self.listeners.dispatch(&envelope.event, envelope.data);
                trace!(id = %self.id, event = %envelope.event, delivered, "Inbound event");
            }
            Err(e) => {
                warn!(id = %self.id, error = %e, "Ignoring malformed frame");
            }
        }
    }
}

/// Websocket-backed transport handle
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    fn new(url: String, options: TransportOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                url,
                options,
                listeners: ListenerTable::new(),
                lifecycle: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            outbound: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Unique handle id
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Websocket URL this handle dials
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    fn stop_task(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.try_send(());
        }
        // The task exits on its own once it sees the signal
        let _ = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let _ = self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    #[instrument(skip(self, lifecycle), fields(id = %self.shared.id, url = %self.shared.url), level = "debug")]
    fn open(&self, lifecycle: LifecycleHandler) -> ChannelResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::transport("websocket transport already closed"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ChannelError::Runtime {
            message: e.to_string(),
        })?;

        *self.shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(lifecycle);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(outbound_tx);
        *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let handle = runtime.spawn(run_connection(
            Arc::clone(&self.shared),
            outbound_rx,
            shutdown_rx,
        ));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.shared.listeners.add(event, handler);
    }

    fn off(&self, event: &str) {
        self.shared.listeners.remove(event);
    }

    fn remove_all_listeners(&self) {
        self.shared.listeners.clear();
        *self.shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn listener_count(&self, event: &str) -> usize {
        self.shared.listeners.count(event)
    }

    fn emit(&self, event: &str, payload: Value) -> ChannelResult<()> {
        if !self.connected() {
            return Err(ChannelError::transport("websocket transport not connected"));
        }
        let frame = serde_json::to_string(&Envelope {
            event: event.to_string(),
            data: payload,
        })
        .map_err(|e| ChannelError::transport(format!("failed to encode frame: {}", e)))?;

        let guard = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx
                .send(WsMessage::text(frame))
                .map_err(|_| ChannelError::transport("connection task has stopped")),
            None => Err(ChannelError::transport("websocket transport not opened")),
        }
    }

    fn disconnect(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_connected = self.shared.connected.swap(false, Ordering::SeqCst);
        info!(id = %self.shared.id, was_connected, "Disconnecting websocket transport");
        self.stop_task();

        if was_connected {
            if let Some(handler) = self.shared.lifecycle_handler() {
                handler(TransportSignal::Disconnected(DisconnectReason::ClientClosed));
            }
        }
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.stop_task();
    }
}

/// Dial once, honoring the connect deadline
async fn dial(shared: &Shared) -> Result<WsStream, String> {
    let mut request = shared
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("invalid request: {}", e))?;

    let headers = request.headers_mut();
    for (name, value) in &shared.options.extra_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("invalid header name '{}': {}", name, e))?;
        if name == http::header::AUTHORIZATION && shared.options.auth.is_some() {
            debug!("Ignoring extra Authorization header, the auth payload sets it");
            continue;
        }
        let value =
            HeaderValue::from_str(value).map_err(|e| format!("invalid header value: {}", e))?;
        headers.insert(name, value);
    }

    if let Some(auth) = &shared.options.auth {
        let value = HeaderValue::from_str(&auth.bearer())
            .map_err(|e| format!("invalid auth header: {}", e))?;
        headers.insert(http::header::AUTHORIZATION, value);
    }

    match timeout(shared.options.timeout(), connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timeout after {:?}", shared.options.timeout())),
    }
}

/// Connection task: dial with backoff, pump frames, repeat on recoverable drops
async fn run_connection(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<WsMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        let attempt = {
            let shared = Arc::clone(&shared);
            with_backoff(
                reconnect_schedule(&shared.options),
                move || {
                    let shared = Arc::clone(&shared);
                    async move {
                        match dial(&shared).await {
                            Ok(stream) => Ok(stream),
                            Err(message) => {
                                warn!(id = %shared.id, error = %message, "Websocket connect attempt failed");
                                shared.signal(TransportSignal::ConnectError {
                                    message: message.clone(),
                                    transport: TransportKind::WebSocket,
                                });
                                Err(message)
                            }
                        }
                    }
                },
                "websocket connect",
            )
        };

        let stream = tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = attempt => match result {
                Ok(stream) => stream,
                Err(_) => {
                    error!(id = %shared.id, url = %shared.url, "Giving up on websocket connection");
                    break;
                }
            },
        };

        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        shared.connected.store(true, Ordering::SeqCst);
        info!(id = %shared.id, url = %shared.url, "Websocket connected");
        shared.signal(TransportSignal::Connected);

        let reason = match pump(&shared, stream, &mut outbound_rx, &mut shutdown_rx).await {
            Some(reason) => reason,
            None => break,
        };

        shared.connected.store(false, Ordering::SeqCst);
        warn!(id = %shared.id, reason = %reason, "Websocket disconnected");
        shared.signal(TransportSignal::Disconnected(reason.clone()));

        if !reason.is_recoverable() || !shared.options.reconnection {
            break;
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    debug!(id = %shared.id, "Websocket connection task stopped");
}

/// Move frames until the link drops. `None` means shutdown was requested.
async fn pump(
    shared: &Shared,
    stream: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<WsMessage>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> Option<DisconnectReason> {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return None;
            }
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        return Some(DisconnectReason::TransportError(e.to_string()));
                    }
                }
                None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return None;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(id = %shared.id, ?frame, "Server sent close frame");
                    return Some(DisconnectReason::ServerClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(DisconnectReason::TransportError(e.to_string())),
                None => return Some(DisconnectReason::TransportClosed),
            },
        }
    }
}
