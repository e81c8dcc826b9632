//! Resilient realtime event channel
//!
//! [`RealtimeChannel`] owns one transport connection and fans every inbound
//! event out to any number of consumer streams. Subscriptions never block:
//! asking for a stream before the connection exists queues the event name and
//! kicks off a connection attempt, and the listener is attached the moment the
//! transport reports a completed handshake.
//!
//! Transport calls that can raise lifecycle signals (`open`, `disconnect`) are
//! always made with the channel lock released, so transports are free to call
//! back synchronously.

mod connection;
mod gate;
mod registry;
mod state;
mod stream;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ChannelConfig;
use crate::credentials::{CredentialProvider, CredentialSnapshot};
use crate::error::{ChannelError, ChannelResult};
use crate::transport::{
    DisconnectReason, LifecycleHandler, Transport, TransportConnector, TransportKind,
    TransportOptions, TransportSignal,
};
use connection::ConnectionManager;
use gate::InitGate;
use registry::EventRegistry;

pub use state::{ConnectionEvent, ConnectionState};
pub use stream::EventStream;

/// Point-in-time view of the channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    /// Connection state machine position
    pub state: ConnectionState,
    /// Connected and the transport agrees
    pub connected: bool,
    /// A token is present and not expired
    pub credential_valid: bool,
    /// The provider reports the token as expired
    pub credential_expired: bool,
    /// Seconds until the token expires, negative once expired
    pub time_until_expiry_secs: Option<i64>,
    /// Most recent failure, cleared on a successful handshake
    pub last_error: Option<ChannelError>,
    /// Registered event names, sorted
    pub events: Vec<String>,
    /// Event names waiting for the connection
    pub pending: usize,
}

/// The realtime event channel
///
/// Meant to be created once and shared (`Arc<RealtimeChannel>`). Dropping it
/// tears it down.
pub struct RealtimeChannel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    url: String,
    options: TransportOptions,
    connector: Arc<dyn TransportConnector>,
    credentials: Arc<dyn CredentialProvider>,
    inner: Mutex<ChannelInner>,
    state_tx: watch::Sender<ConnectionState>,
}

struct ChannelInner {
    connection: ConnectionManager,
    registry: EventRegistry,
    gate: InitGate,
}

impl RealtimeChannel {
    /// Build a channel. Nothing connects until the first subscription.
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn TransportConnector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> ChannelResult<Self> {
        config.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let url = config.url.trim_end_matches('/').to_string();
        debug!(url = %url, capacity = config.stream_capacity, "Creating realtime channel");

        Ok(Self {
            shared: Arc::new(ChannelShared {
                url,
                options: config.transport,
                connector,
                credentials,
                inner: Mutex::new(ChannelInner {
                    connection: ConnectionManager::new(),
                    registry: EventRegistry::new(config.stream_capacity),
                    gate: InitGate::new(),
                }),
                state_tx,
            }),
        })
    }

    /// Stream of payloads for `event`.
    ///
    /// Returns immediately. The first subscription to a name registers it and,
    /// if needed, starts connecting; later ones share the same transport
    /// listener.
    pub fn subscribe(&self, event: &str) -> EventStream {
        self.shared.subscribe(event)
    }

    /// Connect unless already connected or connecting.
    ///
    /// Without a valid credential this logs and does nothing; the refusal shows
    /// up in [`RealtimeChannel::status`].
    pub fn ensure_connected(&self) {
        self.shared.ensure_connected();
    }

    /// Explicit retry trigger, typically after a credential refresh
    pub fn reconnect(&self) {
        self.shared.reconnect();
    }

    /// Close the connection and complete every stream. Safe to call repeatedly.
    pub fn teardown(&self) {
        self.shared.teardown();
    }

    /// Send a named message over the live connection
    pub fn emit(&self, event: &str, payload: Value) -> ChannelResult<()> {
        self.shared.emit(event, payload)
    }

    /// Current state machine position
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().connection.state()
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Connection and credential summary
    pub fn status(&self) -> ChannelStatus {
        self.shared.status()
    }

    /// Connected with a valid credential
    pub fn is_healthy(&self) -> bool {
        let status = self.status();
        status.connected && status.credential_valid
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl ChannelShared {
    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    #[instrument(skip(self), level = "debug")]
    fn subscribe(self: &Arc<Self>, event: &str) -> EventStream {
        let (stream, needs_connect) = {
            let mut inner = self.lock();
            let ChannelInner {
                connection,
                registry,
                gate,
            } = &mut *inner;

            let (topic, created) = registry.get_or_create(event);
            let stream = topic.stream();

            if !created {
                trace!(event = %event, receivers = topic.receiver_count(), "Joined existing event stream");
                (stream, false)
            } else {
                match connection.handle() {
                    Some(handle) if connection.state().is_connected() => {
                        EventRegistry::attach(handle.as_ref(), &topic);
                        (stream, false)
                    }
                    _ => {
                        gate.enqueue(event);
                        (stream, !gate.in_flight())
                    }
                }
            }
        };

        if needs_connect {
            self.ensure_connected();
        }
        stream
    }

    #[instrument(skip(self), level = "debug")]
    fn ensure_connected(self: &Arc<Self>) {
        let (generation, stale, snapshot) = {
            let mut inner = self.lock();

            if inner.gate.in_flight() {
                debug!("Connection attempt already in flight");
                return;
            }
            if inner.connection.is_live() {
                trace!("Already connected");
                return;
            }

            // Read fresh on every attempt so refreshes and logouts are seen
            let snapshot = match CredentialSnapshot::capture(self.credentials.as_ref()) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(
                        error = %err,
                        expires_at = ?self.credentials.expires_at(),
                        seconds_left = ?self.credentials.time_until_expiry().map(|left| left.num_seconds()),
                        "Not connecting without a valid credential"
                    );
                    inner.connection.record_error(err);
                    return;
                }
            };

            let claimed = inner.gate.begin();
            debug_assert!(claimed, "gate was checked under the same lock");
            let (generation, stale) = inner.connection.begin_attempt();
            self.publish_state(inner.connection.state());
            (generation, stale, snapshot)
        };

        if let Some(stale) = stale {
            debug!(generation, "Tearing down previous transport handle");
            stale.remove_all_listeners();
            stale.disconnect();
        }

        let mut options = self.options.clone();
        options.auth = Some(snapshot.auth_payload());

        let handle = match self.connector.create(&self.url, &options) {
            Ok(handle) => handle,
            Err(err) => {
                self.fail_attempt(generation, err, options.primary_kind());
                return;
            }
        };

        {
            let mut inner = self.lock();
            if !inner.connection.is_current(generation) {
                drop(inner);
                debug!(generation, "Connection attempt superseded before open");
                handle.disconnect();
                return;
            }
            inner.connection.install(Arc::clone(&handle));
        }

        info!(
            generation,
            url = %self.url,
            transport = %handle.kind(),
            expires_at = ?snapshot.expires_at(),
            "Opening realtime connection"
        );

        if let Err(err) = handle.open(self.lifecycle_handler(generation)) {
            self.fail_attempt(generation, err, handle.kind());
        }
    }

    /// Record a failure that happened before the transport could report one
    fn fail_attempt(&self, generation: u64, err: ChannelError, transport: TransportKind) {
        let failed = {
            let mut inner = self.lock();
            if !inner.connection.is_current(generation) {
                return;
            }
            inner.gate.finish();
            inner.connection.apply(ConnectionEvent::AttemptFailed);
            error!(generation, error = %err, transport = %transport, "Failed to start realtime connection");
            inner.connection.record_error(err);
            self.publish_state(inner.connection.state());
            inner.connection.take_handle()
        };

        if let Some(handle) = failed {
            handle.remove_all_listeners();
            handle.disconnect();
        }
    }

    fn lifecycle_handler(self: &Arc<Self>, generation: u64) -> LifecycleHandler {
        let shared = Arc::downgrade(self);
        Arc::new(move |signal: TransportSignal| {
            if let Some(shared) = shared.upgrade() {
                shared.handle_signal(generation, signal);
            }
        })
    }

    fn handle_signal(&self, generation: u64, signal: TransportSignal) {
        let retired = {
            let mut inner = self.lock();
            if !inner.connection.is_current(generation) {
                trace!(
                    generation,
                    current = inner.connection.generation(),
                    signal = ?signal,
                    "Ignoring signal from superseded transport handle"
                );
                return;
            }

            let retired = match signal {
                TransportSignal::Connected => {
                    self.on_connected(&mut inner, generation);
                    None
                }
                TransportSignal::ConnectError { message, transport } => {
                    self.on_connect_error(&mut inner, generation, message, transport);
                    None
                }
                TransportSignal::Disconnected(reason) => {
                    self.on_disconnected(&mut inner, generation, reason)
                }
            };

            self.publish_state(inner.connection.state());
            retired
        };

        if let Some(handle) = retired {
            handle.remove_all_listeners();
            handle.disconnect();
        }
    }

    fn on_connected(&self, inner: &mut ChannelInner, generation: u64) {
        inner.gate.finish();
        inner.connection.apply(ConnectionEvent::Established);
        inner.connection.clear_error();

        // Pending names are drained exactly once; the pass below re-attaches
        // every registered name, which also covers a transport-level reconnect.
        let pending = inner.gate.drain_pending();
        let attached = match inner.connection.handle() {
            Some(handle) => inner.registry.attach_all(handle.as_ref()),
            None => 0,
        };

        info!(
            generation,
            pending = pending.len(),
            attached,
            "Realtime connection established"
        );
    }

    fn on_connect_error(
        &self,
        inner: &mut ChannelInner,
        generation: u64,
        message: String,
        transport: TransportKind,
    ) {
        inner.gate.finish();
        inner.connection.apply(ConnectionEvent::AttemptFailed);

        let err = if is_auth_failure(&message) && self.credentials.is_token_expired() {
            ChannelError::CredentialExpired {
                expired_at: self.credentials.expires_at(),
            }
        } else {
            ChannelError::handshake(message, transport)
        };

        error!(
            generation,
            error = %err,
            transport = %transport,
            url = %self.url,
            "Realtime connection attempt failed"
        );
        inner.connection.record_error(err);
    }

    fn on_disconnected(
        &self,
        inner: &mut ChannelInner,
        generation: u64,
        reason: DisconnectReason,
    ) -> Option<Arc<dyn Transport>> {
        inner.connection.apply(ConnectionEvent::Lost);

        if reason.is_deliberate_or_transport_close() && self.credentials.is_token_expired() {
            warn!(
                generation,
                reason = %reason,
                "Connection closed with an expired credential, not reconnecting"
            );
            inner.connection.record_error(ChannelError::CredentialExpired {
                expired_at: self.credentials.expires_at(),
            });
            return inner.connection.retire();
        }

        match reason {
            DisconnectReason::ClientClosed => {
                debug!(generation, "Realtime connection closed by client");
            }
            ref reason => {
                warn!(
                    generation,
                    reason = %reason,
                    recoverable = reason.is_recoverable(),
                    "Realtime connection lost"
                );
                inner.connection.record_error(ChannelError::ConnectionLost {
                    reason: reason.to_string(),
                });
            }
        }
        None
    }

    #[instrument(skip(self), level = "debug")]
    fn reconnect(self: &Arc<Self>) {
        if self.lock().connection.is_live() {
            debug!("Already connected, nothing to reconnect");
            return;
        }

        if let Err(err) = CredentialSnapshot::capture(self.credentials.as_ref()) {
            warn!(error = %err, "Cannot reconnect without a valid credential");
            self.lock().connection.record_error(err);
            return;
        }

        info!("Reconnecting realtime channel");
        self.ensure_connected();
    }

    #[instrument(skip(self), level = "debug")]
    fn teardown(&self) {
        let (handle, topics) = {
            let mut inner = self.lock();
            let topics = inner.registry.clear();
            inner.gate.reset();
            let handle = inner.connection.reset();
            self.publish_state(inner.connection.state());
            (handle, topics)
        };

        if handle.is_none() && topics.is_empty() {
            trace!("Teardown on an idle channel");
            return;
        }

        if let Some(handle) = handle {
            handle.remove_all_listeners();
            handle.disconnect();
        }

        info!(streams = topics.len(), "Realtime channel torn down");
        // Last strong references to the topics; consumer streams complete here
        drop(topics);
    }

    fn emit(&self, event: &str, payload: Value) -> ChannelResult<()> {
        let handle = {
            let inner = self.lock();
            match inner.connection.handle() {
                Some(handle) if inner.connection.is_live() => handle,
                _ => return Err(ChannelError::transport("not connected")),
            }
        };
        handle.emit(event, payload)
    }

    fn status(&self) -> ChannelStatus {
        let has_token = self
            .credentials
            .token()
            .map_or(false, |token| !token.is_empty());
        let credential_expired = self.credentials.is_token_expired();
        let time_until_expiry_secs = self
            .credentials
            .time_until_expiry()
            .map(|left| left.num_seconds());

        let inner = self.lock();
        let mut events = inner.registry.names();
        events.sort();
        ChannelStatus {
            state: inner.connection.state(),
            connected: inner.connection.is_live(),
            credential_valid: has_token && !credential_expired,
            credential_expired,
            time_until_expiry_secs,
            last_error: inner.connection.last_error(),
            events,
            pending: inner.gate.pending_len(),
        }
    }
}

/// Whether a handshake failure message points at the credential
fn is_auth_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["auth", "token", "401", "403", "unauthorized", "forbidden"]
        .iter()
        .any(|needle| message.contains(needle))
}
