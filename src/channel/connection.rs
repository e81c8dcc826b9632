//! Connection bookkeeping
//!
//! Owns the single transport handle, its generation number, the connection
//! state and the last recorded error. Pure state: nothing in here calls into a
//! transport in a way that can re-enter the channel.

use std::sync::Arc;

use tracing::debug;

use super::state::{ConnectionEvent, ConnectionState};
use crate::error::ChannelError;
use crate::transport::Transport;

pub(crate) struct ConnectionManager {
    state: ConnectionState,
    handle: Option<Arc<dyn Transport>>,
    /// Bumped for every new handle and on teardown. Lifecycle signals tagged
    /// with an older generation are ignored.
    generation: u64,
    last_error: Option<ChannelError>,
}

impl ConnectionManager {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            handle: None,
            generation: 0,
            last_error: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn Transport>> {
        self.handle.clone()
    }

    pub(crate) fn last_error(&self) -> Option<ChannelError> {
        self.last_error.clone()
    }

    /// Connected, with a handle that agrees
    pub(crate) fn is_live(&self) -> bool {
        self.state.is_connected() && self.handle.as_ref().map_or(false, |h| h.connected())
    }

    /// Apply `event` to the state machine, returning the new state
    pub(crate) fn apply(&mut self, event: ConnectionEvent) -> ConnectionState {
        let previous = self.state;
        self.state = previous.next(event);
        if previous != self.state {
            debug!(
                from = ?previous,
                to = ?self.state,
                generation = self.generation,
                "Connection state changed"
            );
        }
        self.state
    }

    /// Start a new attempt: detach the old handle and open a new generation.
    /// Returns the new generation and the handle being replaced.
    pub(crate) fn begin_attempt(&mut self) -> (u64, Option<Arc<dyn Transport>>) {
        let stale = self.handle.take();
        self.generation += 1;
        self.apply(ConnectionEvent::AttemptStarted);
        (self.generation, stale)
    }

    /// Install the handle for the current attempt
    pub(crate) fn install(&mut self, handle: Arc<dyn Transport>) {
        self.handle = Some(handle);
    }

    /// Remove the handle of a failed attempt. Only the current generation's
    /// handle is ever installed, so the generation stays as is.
    pub(crate) fn take_handle(&mut self) -> Option<Arc<dyn Transport>> {
        self.handle.take()
    }

    /// Remove the handle and silence any signal it still emits
    pub(crate) fn retire(&mut self) -> Option<Arc<dyn Transport>> {
        self.generation += 1;
        self.handle.take()
    }

    pub(crate) fn record_error(&mut self, error: ChannelError) {
        self.last_error = Some(error);
    }

    pub(crate) fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Forget the handle and invalidate every outstanding generation
    pub(crate) fn reset(&mut self) -> Option<Arc<dyn Transport>> {
        self.generation += 1;
        self.apply(ConnectionEvent::TornDown);
        self.last_error = None;
        self.handle.take()
    }
}
