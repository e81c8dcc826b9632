//! Fan-out registry
//!
//! One broadcast topic per event name. The transport only ever sees a single
//! handler per name; that handler republishes into the topic, and every
//! consumer stream reads from the topic.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::stream::EventStream;
use crate::config::MAX_STREAM_CAPACITY;
use crate::transport::{EventHandler, Transport};

/// Broadcast source for one event name
pub(crate) struct Topic {
    name: String,
    sender: broadcast::Sender<Value>,
}

impl Topic {
    fn new(name: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.to_string(),
            sender,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// New consumer stream
    pub(crate) fn stream(&self) -> EventStream {
        EventStream::new(&self.name, &self.sender)
    }

    /// Live consumer streams
    pub(crate) fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Forward a payload to every consumer, returning how many received it
    pub(crate) fn publish(&self, payload: Value) -> usize {
        match self.sender.send(payload) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(event = %self.name, "No consumers for inbound payload");
                0
            }
        }
    }

    /// Transport handler feeding this topic.
    ///
    /// Holds only a weak reference so clearing the registry completes every
    /// consumer stream even if a stale handle still has the handler attached.
    pub(crate) fn handler(self: &Arc<Self>) -> EventHandler {
        let topic: Weak<Topic> = Arc::downgrade(self);
        Arc::new(move |payload: Value| {
            if let Some(topic) = topic.upgrade() {
                topic.publish(payload);
            }
        })
    }
}

/// Event name to topic map
pub(crate) struct EventRegistry {
    topics: HashMap<String, Arc<Topic>>,
    capacity: usize,
}

impl EventRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            topics: HashMap::new(),
            capacity: capacity.clamp(1, MAX_STREAM_CAPACITY),
        }
    }

    /// Topic for `name`, and whether it was just created
    pub(crate) fn get_or_create(&mut self, name: &str) -> (Arc<Topic>, bool) {
        if let Some(topic) = self.topics.get(name) {
            return (Arc::clone(topic), false);
        }

        debug!(event = %name, capacity = self.capacity, "Registering event topic");
        let topic = Arc::new(Topic::new(name, self.capacity));
        self.topics.insert(name.to_string(), Arc::clone(&topic));
        (topic, true)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Remove every topic, handing them back so the caller decides when the
    /// last strong reference goes away
    pub(crate) fn clear(&mut self) -> Vec<Arc<Topic>> {
        self.topics.drain().map(|(_, topic)| topic).collect()
    }

    /// Put exactly one handler for `topic` on `transport`
    pub(crate) fn attach(transport: &dyn Transport, topic: &Arc<Topic>) {
        transport.off(topic.name());
        transport.on(topic.name(), topic.handler());
        trace!(event = %topic.name(), "Attached transport listener");
    }

    /// Attach every registered name. Returns how many were attached.
    pub(crate) fn attach_all(&self, transport: &dyn Transport) -> usize {
        for topic in self.topics.values() {
            Self::attach(transport, topic);
        }
        self.topics.len()
    }
}
