use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};

/// Stream of inbound payloads for one event name
///
/// Ends when the channel is torn down. Cloning (or [`EventStream::resubscribe`])
/// yields an independent consumer that sees every payload published after it
/// was created.
pub struct EventStream {
    event: String,
    source: broadcast::WeakSender<Value>,
    inner: BoxStream<'static, Value>,
}

impl EventStream {
    pub(crate) fn new(event: &str, sender: &broadcast::Sender<Value>) -> Self {
        Self {
            event: event.to_string(),
            source: sender.downgrade(),
            inner: receive_loop(event.to_string(), sender.subscribe()).boxed(),
        }
    }

    /// Event name this stream carries
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Start an independent consumer on the same event.
    ///
    /// After teardown the new stream is already complete.
    pub fn resubscribe(&self) -> Self {
        match self.source.upgrade() {
            Some(sender) => Self::new(&self.event, &sender),
            None => Self {
                event: self.event.clone(),
                source: self.source.clone(),
                inner: futures::stream::empty().boxed(),
            },
        }
    }

    /// Wait for the next payload. `None` once the channel is torn down.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inner.next().await
    }
}

impl Clone for EventStream {
    fn clone(&self) -> Self {
        self.resubscribe()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("event", &self.event)
            .finish()
    }
}

impl Stream for EventStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

fn receive_loop(
    event: String,
    mut receiver: broadcast::Receiver<Value>,
) -> impl Stream<Item = Value> + Send + 'static {
    async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(payload) => {
                    yield payload;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = %event, skipped, "Consumer lagged behind, skipping payloads");
                }
                Err(RecvError::Closed) => {
                    trace!(event = %event, "Event stream completed");
                    break;
                }
            }
        }
    }
}
