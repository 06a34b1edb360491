use async_broadcast::{InactiveReceiver, Sender, TrySendError};
use dashmap::DashMap;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::broker::{Broker, Envelope, Subscription};

const DEFAULT_CAPACITY: usize = 1000;

/// In-process broker: one broadcast channel per path, created on first use.
///
/// A full channel drops its oldest envelope. Publishing to a path nobody
/// listens on is a silent drop.
#[derive(Debug)]
pub struct LocalBroker {
    channels: DashMap<String, (Sender<Envelope>, InactiveReceiver<Envelope>)>,
    capacity: usize,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Ensures a channel exists, creating it if necessary.
    fn ensure_channel(&self, path: &str) -> Sender<Envelope> {
        if let Some(entry) = self.channels.get(path) {
            return entry.0.clone();
        }
        let entry = self.channels.entry(path.to_string()).or_insert_with(|| {
            let (mut tx, rx) = async_broadcast::broadcast(self.capacity);
            tx.set_overflow(true); // Drop oldest envelopes when full
            info!(path = %path, capacity = self.capacity, "Created broker channel");
            (tx, rx.deactivate())
        });
        entry.0.clone()
    }

    /// Paths that currently have a channel
    pub fn paths(&self) -> Vec<String> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for LocalBroker {
    fn publish(&self, envelope: Envelope) {
        let sender = match self.channels.get(&envelope.path) {
            Some(entry) => entry.0.clone(),
            None => {
                debug!(path = %envelope.path, "No channel for path, dropping envelope");
                return;
            }
        };
        let path = envelope.path.clone();
        match sender.try_broadcast(envelope) {
            Ok(Some(_)) => warn!(path = %path, "Channel at capacity, dropped oldest envelope"),
            Ok(None) => debug!(path = %path, "Published envelope"),
            Err(TrySendError::Inactive(_)) => {
                debug!(path = %path, "No active subscribers, dropping envelope")
            }
            Err(e) => warn!(path = %path, error = %e, "Failed to publish envelope"),
        }
    }

    fn subscribe(&self, path: &str) -> Subscription {
        self.ensure_channel(path).new_receiver().boxed()
    }

    fn subscriber_count(&self, path: &str) -> usize {
        self.channels
            .get(path)
            .map(|entry| entry.0.receiver_count())
            .unwrap_or(0)
    }
}
