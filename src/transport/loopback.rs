//! In-process transport
//!
//! Nothing goes over the network. The "server" side is driven by calling
//! [`LoopbackTransport::complete_handshake`], [`LoopbackTransport::push`] and
//! friends, which makes every lifecycle path of the channel reachable from a
//! test or a demo without a live backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    DisconnectReason, EventHandler, LifecycleHandler, ListenerTable, Transport,
    TransportConnector, TransportKind, TransportOptions, TransportSignal,
};
use crate::error::{ChannelError, ChannelResult};

/// Connector that hands out loopback handles and remembers them
#[derive(Default)]
pub struct LoopbackConnector {
    /// Every handle created so far, oldest first
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
    /// Complete the handshake as soon as a handle is opened
    auto_connect: bool,
}

impl LoopbackConnector {
    /// Handles stay in `Connecting` until told otherwise
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles connect the moment they are opened
    pub fn auto_connect() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            auto_connect: true,
        }
    }

    /// Number of handles created so far
    pub fn created_count(&self) -> usize {
        self.lock().len()
    }

    /// Every handle created so far
    pub fn handles(&self) -> Vec<Arc<LoopbackTransport>> {
        self.lock().clone()
    }

    /// The most recently created handle
    pub fn latest(&self) -> Option<Arc<LoopbackTransport>> {
        self.lock().last().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<LoopbackTransport>>> {
        self.created.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TransportConnector for LoopbackConnector {
    fn create(&self, url: &str, options: &TransportOptions) -> ChannelResult<Arc<dyn Transport>> {
        if url.is_empty() {
            return Err(ChannelError::transport("empty target address"));
        }

        let transport = Arc::new(LoopbackTransport::new(url, options.clone(), self.auto_connect));
        debug!(id = %transport.id, url = %url, "Created loopback transport");
        self.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// A transport handle whose server side is driven by the caller
pub struct LoopbackTransport {
    id: Uuid,
    url: String,
    options: TransportOptions,
    auto_connect: bool,
    listeners: ListenerTable,
    lifecycle: Mutex<Option<LifecycleHandler>>,
    opened: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    emitted: Mutex<Vec<(String, Value)>>,
}

impl LoopbackTransport {
    fn new(url: &str, options: TransportOptions, auto_connect: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            options,
            auto_connect,
            listeners: ListenerTable::new(),
            lifecycle: Mutex::new(None),
            opened: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            emitted: Mutex::new(Vec::new()),
        }
    }

    /// Unique handle id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Target address the handle was created for
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Options the handle was created with, auth payload included
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Whether `open` has been called
    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Whether `disconnect` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a lifecycle handler is still attached
    pub fn has_lifecycle_handler(&self) -> bool {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Messages sent through `emit`, oldest first
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Server accepts the handshake
    #[instrument(skip(self), fields(id = %self.id), level = "debug")]
    pub fn complete_handshake(&self) {
        if self.is_closed() {
            return;
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("Loopback transport connected");
        self.signal(TransportSignal::Connected);
    }

    /// Server rejects the handshake
    #[instrument(skip(self), fields(id = %self.id), level = "debug")]
    pub fn fail_handshake(&self, message: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.signal(TransportSignal::ConnectError {
            message: message.to_string(),
            transport: self.kind(),
        });
    }

    /// The established link goes away
    #[instrument(skip(self), fields(id = %self.id), level = "debug")]
    pub fn drop_connection(&self, reason: DisconnectReason) {
        self.connected.store(false, Ordering::SeqCst);
        self.signal(TransportSignal::Disconnected(reason));
    }

    /// Server sends `payload` under `event`. Returns how many handlers ran.
    pub fn push(&self, event: &str, payload: Value) -> usize {
        if !self.connected() {
            debug!(id = %self.id, event = %event, "Dropping push on a disconnected loopback");
            return 0;
        }
        self.listeners.dispatch(event, payload)
    }

    fn signal(&self, signal: TransportSignal) {
        let handler = self
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(signal);
        }
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn open(&self, lifecycle: LifecycleHandler) -> ChannelResult<()> {
        if self.is_closed() {
            return Err(ChannelError::transport("loopback transport already closed"));
        }
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(lifecycle);
        self.opened.store(true, Ordering::SeqCst);

        if self.auto_connect {
            self.complete_handshake();
        }
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.listeners.add(event, handler);
    }

    fn off(&self, event: &str) {
        self.listeners.remove(event);
    }

    fn remove_all_listeners(&self) {
        self.listeners.clear();
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn listener_count(&self, event: &str) -> usize {
        self.listeners.count(event)
    }

    fn emit(&self, event: &str, payload: Value) -> ChannelResult<()> {
        if !self.connected() {
            return Err(ChannelError::transport("loopback transport not connected"));
        }
        self.emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((event.to_string(), payload));
        Ok(())
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        debug!(id = %self.id, was_connected, "Loopback transport disconnected");
        if was_connected {
            self.signal(TransportSignal::Disconnected(DisconnectReason::ClientClosed));
        }
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
