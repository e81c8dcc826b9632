use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::StreamExt;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use beacon_lib::{
    ChannelConfig, ConnectionState, ErrorKind, RealtimeChannel, TokenData, TokenStore,
    WebSocketConnector,
};

/// Token environment variable
const TOKEN_ENV: &str = "BEACON_TOKEN";

/// Pause before reconnecting after a failed handshake
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Follow realtime events from the command line
#[derive(Debug, Parser)]
#[command(name = "beacon", version, about)]
struct Args {
    /// Event names to follow
    #[arg(short, long = "event", required = true)]
    events: Vec<String>,

    /// Server address, overrides BEACON_URL
    #[arg(long)]
    url: Option<String>,
}

fn load_token() -> Result<TokenData> {
    let raw = dotenvy::var(TOKEN_ENV).map_err(|_| anyhow!("{} is not set", TOKEN_ENV))?;
    if raw.is_empty() {
        return Err(anyhow!("{} is empty", TOKEN_ENV));
    }

    match TokenData::from_jwt(raw.clone()) {
        Ok(token) => Ok(token),
        Err(e) => {
            debug!(error = %e, "Token is not a JWT, using it without expiry");
            Ok(TokenData::new(raw, None))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file_path = dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "beacon_lib=debug,beacon=debug,warn".into()
            } else {
                "beacon_lib=info,beacon=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let args = Args::parse();

    let config = match args.url {
        Some(url) => ChannelConfig::new(url),
        None => ChannelConfig::from_env().context("Failed to load channel config")?,
    };

    let credentials = Arc::new(TokenStore::with_token(load_token()?));
    let channel = Arc::new(RealtimeChannel::new(
        config,
        Arc::new(WebSocketConnector::new()),
        credentials,
    )?);

    let mut consumers = Vec::new();
    for event in args.events {
        let mut stream = channel.subscribe(&event);
        consumers.push(tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                info!(event = %event, payload = %payload, "Received event");
            }
            debug!(event = %event, "Event stream completed");
        }));
    }

    let mut state_changes = channel.state_changes();
    let watcher = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            while state_changes.changed().await.is_ok() {
                let status = channel.status();
                info!(state = ?status.state, healthy = channel.is_healthy(), "Channel state changed");
                let Some(err) = status.last_error else {
                    continue;
                };
                match err.kind() {
                    ErrorKind::Credential => {
                        warn!(error = %err, "Credential refused, set a fresh {} and restart", TOKEN_ENV);
                    }
                    ErrorKind::Disconnect => {
                        debug!(error = %err, "Connection lost, transport is retrying");
                    }
                    _ if err.is_retryable() && status.state == ConnectionState::Disconnected => {
                        warn!(error = %err, delay = ?RETRY_DELAY, "Handshake failed, reconnecting");
                        tokio::time::sleep(RETRY_DELAY).await;
                        channel.reconnect();
                    }
                    _ => warn!(error = %err, "Last channel error"),
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    channel.teardown();
    for consumer in consumers {
        let _ = consumer.await;
    }
    watcher.abort();

    Ok(())
}
