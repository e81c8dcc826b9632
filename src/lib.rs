//! Beacon: a resilient realtime event channel
//!
//! One authenticated, multiplexed connection to a realtime server, shared by
//! any number of consumers through per-event broadcast streams.
//!
//! ```no_run
//! use std::sync::Arc;
//! use beacon_lib::{ChannelConfig, RealtimeChannel, TokenData, TokenStore, WebSocketConnector};
//! use futures::StreamExt;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let credentials = Arc::new(TokenStore::with_token(TokenData::new("token", None)));
//! let channel = RealtimeChannel::new(
//!     ChannelConfig::new("https://realtime.example.com"),
//!     Arc::new(WebSocketConnector::new()),
//!     credentials,
//! )?;
//!
//! let mut alerts = channel.subscribe("alert");
//! while let Some(payload) = alerts.next().await {
//!     println!("{}", payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod retry;
pub mod transport;

pub use channel::{ChannelStatus, ConnectionState, EventStream, RealtimeChannel};
pub use config::ChannelConfig;
pub use credentials::{AuthPayload, CredentialProvider, CredentialSnapshot, TokenData, TokenStore};
pub use error::{ChannelError, ChannelResult, ErrorKind};
pub use transport::{
    DisconnectReason, LoopbackConnector, LoopbackTransport, Transport, TransportConnector,
    TransportKind, TransportOptions, TransportSignal, WebSocketConnector,
};

#[cfg(test)]
mod tests;
