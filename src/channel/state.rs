use serde::{Deserialize, Serialize};

/// Lifecycle state of the channel's single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live handle, or the handle is down
    Disconnected,
    /// A handshake is in flight
    Connecting,
    /// The handshake completed and listeners are attached
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Inputs to [`ConnectionState::next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new handle was created and opened
    AttemptStarted,
    /// The transport reported a completed handshake
    Established,
    /// The transport reported a failed attempt
    AttemptFailed,
    /// An established link went away
    Lost,
    /// The channel was torn down
    TornDown,
}

impl ConnectionState {
    /// The single transition function of the connection state machine
    pub fn next(self, event: ConnectionEvent) -> Self {
        use ConnectionEvent as E;

        match (self, event) {
            (_, E::TornDown) => Self::Disconnected,
            (_, E::AttemptStarted) => Self::Connecting,
            (_, E::Established) => Self::Connected,
            (_, E::AttemptFailed) | (_, E::Lost) => Self::Disconnected,
        }
    }

    /// Whether this is the connected state
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}
