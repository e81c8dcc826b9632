use std::fmt::Display;
use std::time::Duration;

use tokio_retry::{Action, Retry};
use tracing::{debug, warn};

use crate::config::MAX_RECONNECTION_ATTEMPTS;
use crate::transport::TransportOptions;

/// Exponential backoff strategy: base * 2^(attempt-1), with an optional ceiling
pub fn exponential_backoff(
    base_ms: u64,
    max_ms: Option<u64>,
) -> impl Fn(usize) -> Duration + Send + Sync {
    move |attempt| {
        let exponent = attempt.saturating_sub(1).min(32) as u32;
        let delay = base_ms.saturating_mul(2u64.saturating_pow(exponent));
        match max_ms {
            Some(max) => Duration::from_millis(delay.min(max)),
            None => Duration::from_millis(delay),
        }
    }
}

/// Add up to 25% jitter to any backoff function
pub fn with_jitter<F>(backoff_fn: F) -> impl Fn(usize) -> Duration + Send + Sync
where
    F: Fn(usize) -> Duration + Send + Sync,
{
    move |attempt| {
        let delay = backoff_fn(attempt);
        let jitter_factor = fastrand::f64() * 0.25;
        let jitter_ms = (delay.as_millis() as f64 * jitter_factor) as u64;
        delay + Duration::from_millis(jitter_ms)
    }
}

/// Delays between retries for the given options, one per allowed retry.
///
/// Empty when reconnection is disabled.
pub fn reconnect_schedule(options: &TransportOptions) -> Vec<Duration> {
    if !options.reconnection {
        return Vec::new();
    }

    let backoff = with_jitter(exponential_backoff(
        options.reconnection_delay_ms,
        Some(options.reconnection_delay_max_ms),
    ));
    (1..=options.reconnection_attempts.min(MAX_RECONNECTION_ATTEMPTS) as usize)
        .map(backoff)
        .map(|delay| delay.min(options.reconnection_delay_max()))
        .collect()
}

/// Run `action` once, then once more after each delay in `schedule` until it
/// succeeds or the schedule runs out.
pub async fn with_backoff<I, A>(schedule: I, action: A, log_context: &str) -> Result<A::Item, A::Error>
where
    I: IntoIterator<Item = Duration>,
    A: Action,
    A::Error: Display,
{
    let delays: Vec<Duration> = schedule.into_iter().collect();
    let max_attempts = delays.len() + 1;

    match Retry::start(delays, action).await {
        Ok(value) => {
            debug!(context = %log_context, "Operation succeeded");
            Ok(value)
        }
        Err(e) => {
            warn!(
                context = %log_context,
                attempts = max_attempts,
                error = %e,
                "Operation failed after exhausting backoff"
            );
            Err(e)
        }
    }
}
