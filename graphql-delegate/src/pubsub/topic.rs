use std::collections::HashMap;

use parking_lot::Mutex;

use super::channel::Channel;
use super::channel::Subscription;
use crate::error::FetchError;

/// Named [`Channel`]s, created on first subscription.
///
/// A `PubSub` belongs to whoever publishes on it; it is never shared process-wide.
pub struct PubSub<T> {
    channels: Mutex<HashMap<String, Channel<T>>>,
    capacity: usize,
}

impl<T> PubSub<T>
where
    T: Clone,
{
    pub fn new(capacity: usize) -> Self {
        PubSub {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Publishes on `topic`. A topic nobody listens to anymore is pruned.
    pub fn publish(&self, topic: &str, value: T) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(topic) {
            tracing::trace!(topic, "publishing");
            channel.publish(value);
            if channel.subscriber_count() == 0 {
                channels.remove(topic);
            }
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription<T> {
        self.channels
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| Channel::new(self.capacity))
            .subscribe()
    }

    /// Ends the subscriptions of a single topic.
    pub fn unpublish(&self, topic: &str, reason: Option<FetchError>) {
        let channel = self.channels.lock().remove(topic);
        if let Some(channel) = channel {
            channel.unpublish(reason);
        }
    }

    /// Ends every subscription of every topic.
    ///
    /// Later subscriptions open fresh channels.
    pub fn close(&self, reason: Option<FetchError>) {
        let channels = std::mem::take(&mut *self.channels.lock());
        tracing::debug!(topics = channels.len(), "closing every topic");
        for channel in channels.into_values() {
            channel.unpublish(reason.clone());
        }
    }

    pub fn topic_count(&self) -> usize {
        self.channels.lock().len()
    }
}
