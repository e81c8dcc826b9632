//! Channel configuration
//!
//! Built once at startup, either from serde (a config file or store) or from
//! `BEACON_*` environment variables, then handed to the channel.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChannelError, ChannelResult};
use crate::transport::TransportOptions;

/// Default buffered payloads per event before slow consumers start lagging
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Upper bound for `stream_capacity`
pub const MAX_STREAM_CAPACITY: usize = 65_536;

/// Upper bound for `reconnection_attempts`
pub const MAX_RECONNECTION_ATTEMPTS: u32 = 100;

/// Environment variable names
pub const ENV_URL: &str = "BEACON_URL";
pub const ENV_RECONNECTION_ATTEMPTS: &str = "BEACON_RECONNECTION_ATTEMPTS";
pub const ENV_RECONNECTION_DELAY_MS: &str = "BEACON_RECONNECTION_DELAY_MS";
pub const ENV_RECONNECTION_DELAY_MAX_MS: &str = "BEACON_RECONNECTION_DELAY_MAX_MS";
pub const ENV_TIMEOUT_MS: &str = "BEACON_TIMEOUT_MS";
pub const ENV_STREAM_CAPACITY: &str = "BEACON_STREAM_CAPACITY";

/// Configuration for a realtime channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Base address of the realtime server
    pub url: String,
    /// Options passed to every transport handle
    #[serde(default)]
    pub transport: TransportOptions,
    /// Buffered payloads per event name
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

fn default_stream_capacity() -> usize {
    DEFAULT_STREAM_CAPACITY
}

impl ChannelConfig {
    /// Config for `url` with default transport options
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: normalize_url(&url.into()),
            transport: TransportOptions::default(),
            stream_capacity: default_stream_capacity(),
        }
    }

    /// Load from the process environment, reading `.env` if one exists
    pub fn from_env() -> ChannelResult<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> ChannelResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(ENV_URL)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ChannelError::invalid_config(ENV_URL, "not set"))?;

        let mut config = Self::new(url.trim());
        let transport = &mut config.transport;

        if let Some(attempts) = parse(&lookup, ENV_RECONNECTION_ATTEMPTS)? {
            transport.reconnection_attempts = attempts;
        }
        if let Some(delay) = parse(&lookup, ENV_RECONNECTION_DELAY_MS)? {
            transport.reconnection_delay_ms = delay;
        }
        if let Some(delay_max) = parse(&lookup, ENV_RECONNECTION_DELAY_MAX_MS)? {
            transport.reconnection_delay_max_ms = delay_max;
        }
        if let Some(timeout) = parse(&lookup, ENV_TIMEOUT_MS)? {
            transport.timeout_ms = timeout;
        }
        if let Some(capacity) = parse(&lookup, ENV_STREAM_CAPACITY)? {
            config.stream_capacity = capacity;
        }

        config.validate()?;
        debug!(url = %config.url, "Loaded channel config from environment");
        Ok(config)
    }

    /// Reject values no transport can work with
    pub fn validate(&self) -> ChannelResult<()> {
        if self.url.trim().is_empty() {
            return Err(ChannelError::invalid_config("url", "must not be empty"));
        }
        if self.transport.transports.is_empty() {
            return Err(ChannelError::invalid_config(
                "transports",
                "at least one transport kind is required",
            ));
        }
        if self.transport.reconnection_attempts > MAX_RECONNECTION_ATTEMPTS {
            return Err(ChannelError::invalid_config(
                "reconnection_attempts",
                format!("must be at most {}", MAX_RECONNECTION_ATTEMPTS),
            ));
        }
        if self.transport.reconnection_delay_ms > self.transport.reconnection_delay_max_ms {
            return Err(ChannelError::invalid_config(
                "reconnection_delay_ms",
                format!(
                    "{} exceeds reconnection_delay_max_ms {}",
                    self.transport.reconnection_delay_ms, self.transport.reconnection_delay_max_ms
                ),
            ));
        }
        if self.transport.timeout_ms == 0 {
            return Err(ChannelError::invalid_config("timeout_ms", "must be positive"));
        }
        if self.stream_capacity == 0 {
            return Err(ChannelError::invalid_config(
                "stream_capacity",
                "must be positive",
            ));
        }
        if self.stream_capacity > MAX_STREAM_CAPACITY {
            return Err(ChannelError::invalid_config(
                "stream_capacity",
                format!("must be at most {}", MAX_STREAM_CAPACITY),
            ));
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> ChannelResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ChannelError::invalid_config(key, format!("'{}': {}", raw, e))),
        None => Ok(None),
    }
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
