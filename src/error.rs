//! Error types for the realtime channel
//!
//! None of these errors is fatal to the owning process. Lifecycle operations on
//! the channel record them as `last_error` instead of returning them, so the
//! only places a caller sees a `ChannelResult` are construction and config
//! loading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportKind;

/// Result alias used across the crate
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Coarse classification of channel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or expired bearer token
    Credential,
    /// The transport could not complete its handshake
    Handshake,
    /// An established link went away
    Disconnect,
    /// Bad configuration values
    Configuration,
    /// Anything else (no runtime, transport bugs)
    Internal,
}

/// Unified error type for channel operations
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelError {
    /// No token could be obtained from the credential provider
    #[error("No credential available")]
    CredentialMissing,

    /// The credential provider reports the token as expired
    #[error("Credential expired")]
    CredentialExpired {
        /// When the token expired, if known
        expired_at: Option<DateTime<Utc>>,
    },

    /// The handshake failed
    #[error("Handshake failed over {transport}: {reason}")]
    Handshake {
        /// Message reported by the transport
        reason: String,
        /// Transport kind that was in use
        transport: TransportKind,
    },

    /// An established connection was lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// Classified disconnect reason
        reason: String,
    },

    /// The transport rejected an operation
    #[error("Transport error: {message}")]
    Transport {
        /// Error message
        message: String,
    },

    /// A configuration value failed validation
    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Offending key
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// No async runtime was available to drive the transport
    #[error("Runtime unavailable: {message}")]
    Runtime {
        /// Error message
        message: String,
    },
}

impl ChannelError {
    /// Create a new transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a new handshake error
    pub fn handshake(reason: impl Into<String>, transport: TransportKind) -> Self {
        Self::Handshake {
            reason: reason.into(),
            transport,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CredentialMissing | Self::CredentialExpired { .. } => ErrorKind::Credential,
            Self::Handshake { .. } => ErrorKind::Handshake,
            Self::ConnectionLost { .. } => ErrorKind::Disconnect,
            Self::InvalidConfig { .. } => ErrorKind::Configuration,
            Self::Transport { .. } | Self::Runtime { .. } => ErrorKind::Internal,
        }
    }

    /// Whether an explicit `reconnect()` can succeed without outside changes.
    ///
    /// Credential errors need a fresh token first and config errors need a new
    /// channel, so neither counts.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Handshake | ErrorKind::Disconnect)
    }
}
