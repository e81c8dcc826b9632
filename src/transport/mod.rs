//! Transport capability consumed by the channel
//!
//! The channel treats the transport as a black box: something that can be
//! pointed at an address, opened with a credential, and then exposes a named
//! listener table plus a handful of lifecycle signals. Two implementations ship
//! with the crate: [`websocket`] for real servers and [`loopback`] for tests
//! and demos.

pub mod loopback;
pub mod websocket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::credentials::AuthPayload;
use crate::error::ChannelResult;

pub use loopback::{LoopbackConnector, LoopbackTransport};
pub use websocket::{WebSocketConnector, WebSocketTransport};

/// Default connection settings
pub(crate) const DEFAULT_RECONNECTION_ATTEMPTS: u32 = 5;
pub(crate) const DEFAULT_RECONNECTION_DELAY_MS: u64 = 1000;
pub(crate) const DEFAULT_RECONNECTION_DELAY_MAX_MS: u64 = 5000;
pub(crate) const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_PATH: &str = "/socket.io/";

/// Handler invoked with every inbound payload for one event name
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Handler invoked with lifecycle signals of one transport handle
pub type LifecycleHandler = Arc<dyn Fn(TransportSignal) + Send + Sync>;

/// Kinds of transport a server may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent websocket
    WebSocket,
    /// HTTP long-polling
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// Why an established link went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the link on purpose
    ServerClosed,
    /// We closed the link
    ClientClosed,
    /// The underlying stream ended without a close handshake
    TransportClosed,
    /// The underlying stream failed
    TransportError(String),
    /// No traffic within the ping window
    PingTimeout,
}

impl DisconnectReason {
    /// Server-initiated or transport-level closes, the two cases where an
    /// expired credential means the link should stay down.
    pub fn is_deliberate_or_transport_close(&self) -> bool {
        matches!(self, Self::ServerClosed | Self::TransportClosed)
    }

    /// Whether the transport's own backoff should try to bring the link back
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ServerClosed | Self::ClientClosed)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerClosed => write!(f, "server disconnect"),
            Self::ClientClosed => write!(f, "client disconnect"),
            Self::TransportClosed => write!(f, "transport close"),
            Self::TransportError(e) => write!(f, "transport error: {}", e),
            Self::PingTimeout => write!(f, "ping timeout"),
        }
    }
}

/// Lifecycle outcome reported by a transport handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// Handshake completed (initially or after an internal reconnect)
    Connected,
    /// A connection attempt failed
    ConnectError {
        /// Diagnostic message from the transport
        message: String,
        /// Transport kind used for the attempt
        transport: TransportKind,
    },
    /// An established link went away
    Disconnected(DisconnectReason),
}

/// Options recognized by transport implementations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Allowed transport kinds in preference order
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,
    /// Whether the transport retries on its own
    #[serde(default = "default_reconnection")]
    pub reconnection: bool,
    /// Maximum automatic retries after a failure
    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,
    /// First backoff delay in milliseconds
    #[serde(default = "default_reconnection_delay_ms")]
    pub reconnection_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_reconnection_delay_max_ms")]
    pub reconnection_delay_max_ms: u64,
    /// Connect deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Endpoint path appended to the target address
    #[serde(default = "default_path")]
    pub path: String,
    /// Credential payload for the handshake, filled per attempt
    #[serde(skip)]
    pub auth: Option<AuthPayload>,
    /// Extra handshake headers, filled per attempt
    #[serde(skip)]
    pub extra_headers: Vec<(String, String)>,
}

fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::WebSocket, TransportKind::Polling]
}

fn default_reconnection() -> bool {
    true
}

fn default_reconnection_attempts() -> u32 {
    DEFAULT_RECONNECTION_ATTEMPTS
}

fn default_reconnection_delay_ms() -> u64 {
    DEFAULT_RECONNECTION_DELAY_MS
}

fn default_reconnection_delay_max_ms() -> u64 {
    DEFAULT_RECONNECTION_DELAY_MAX_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            transports: default_transports(),
            reconnection: default_reconnection(),
            reconnection_attempts: default_reconnection_attempts(),
            reconnection_delay_ms: default_reconnection_delay_ms(),
            reconnection_delay_max_ms: default_reconnection_delay_max_ms(),
            timeout_ms: default_timeout_ms(),
            path: default_path(),
            auth: None,
            extra_headers: Vec::new(),
        }
    }
}

impl TransportOptions {
    /// First backoff delay
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }

    /// Backoff ceiling
    pub fn reconnection_delay_max(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_max_ms)
    }

    /// Connect deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Preferred transport kind, the one reported in diagnostics
    pub fn primary_kind(&self) -> TransportKind {
        self.transports
            .first()
            .copied()
            .unwrap_or(TransportKind::WebSocket)
    }
}

/// One multiplexed connection to the server
pub trait Transport: Send + Sync {
    /// Kind of transport this handle speaks
    fn kind(&self) -> TransportKind;

    /// Start the handshake. Outcomes arrive on `lifecycle`.
    fn open(&self, lifecycle: LifecycleHandler) -> ChannelResult<()>;

    /// Add a handler for `event`
    fn on(&self, event: &str, handler: EventHandler);

    /// Remove every handler for `event`
    fn off(&self, event: &str);

    /// Remove every handler, the lifecycle handler included
    fn remove_all_listeners(&self);

    /// Number of handlers registered for `event`
    fn listener_count(&self, event: &str) -> usize;

    /// Send a named message to the server
    fn emit(&self, event: &str, payload: Value) -> ChannelResult<()>;

    /// Close the link and stop any automatic retry
    fn disconnect(&self);

    /// Whether the handshake has completed and the link is up
    fn connected(&self) -> bool;
}

/// Factory for transport handles
pub trait TransportConnector: Send + Sync {
    /// Build an unopened handle targeting `url`
    fn create(&self, url: &str, options: &TransportOptions) -> ChannelResult<Arc<dyn Transport>>;
}

/// Named handler table shared by the transport implementations
#[derive(Default)]
pub struct ListenerTable {
    handlers: DashMap<String, Vec<EventHandler>>,
}

impl ListenerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event`
    pub fn add(&self, event: &str, handler: EventHandler) {
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Drop every handler for `event`
    pub fn remove(&self, event: &str) {
        self.handlers.remove(event);
    }

    /// Drop every handler
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Handlers registered for `event`
    pub fn count(&self, event: &str) -> usize {
        self.handlers.get(event).map_or(0, |h| h.len())
    }

    /// Call every handler for `event`, returning how many ran
    pub fn dispatch(&self, event: &str, payload: Value) -> usize {
        // Clone out so handlers may touch the table without deadlocking a shard
        let handlers = match self.handlers.get(event) {
            Some(handlers) => handlers.clone(),
            None => {
                trace!(event = %event, "No handlers for inbound event");
                return 0;
            }
        };

        for handler in &handlers {
            handler(payload.clone());
        }
        handlers.len()
    }
}

/// Strip the trailing slash of `base` and append `path`
pub fn endpoint_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() || path == "/" {
        return base.to_string();
    }
    format!("{}/{}", base, path.trim_start_matches('/'))
}
