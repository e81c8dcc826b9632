//! Initialization gate
//!
//! Serializes connection bring-up against subscriptions that arrive before a
//! connection exists. Holds no message data.

use tracing::trace;

/// In-flight flag plus the Pending Attachment queue
#[derive(Debug, Default)]
pub(crate) struct InitGate {
    /// Set the instant an attempt begins, cleared on its terminal outcome
    in_flight: bool,
    /// Event names waiting for their first listener attachment
    pending: Vec<String>,
}

impl InitGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether a connection attempt is in flight
    pub(crate) fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Claim the gate. Returns false if an attempt is already in flight.
    #[must_use]
    pub(crate) fn begin(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Release the gate on the attempt's terminal outcome
    pub(crate) fn finish(&mut self) {
        self.in_flight = false;
    }

    /// Queue `event` until the connection comes up
    pub(crate) fn enqueue(&mut self, event: &str) {
        if self.pending.iter().any(|name| name == event) {
            return;
        }
        trace!(event = %event, "Queued pending listener attachment");
        self.pending.push(event.to_string());
    }

    /// Take every pending name, leaving the queue empty
    pub(crate) fn drain_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    /// Number of queued names
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget everything
    pub(crate) fn reset(&mut self) {
        self.in_flight = false;
        self.pending.clear();
    }
}
