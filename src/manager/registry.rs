//! Subscription registry
//!
//! Ordered topic filter -> {id, qos, handler}. Read on every (re)connect to
//! replay subscriptions in registration order; written only by subscribe and
//! unsubscribe.

use super::dispatch::MessageHandler;
use crate::topics::topic_matches;
use crate::transport::QoS;
use std::fmt;
use std::sync::Arc;

/// Registration id, unique for the lifetime of a manager
pub type SubscriptionId = u64;

/// Returned by `subscribe`; identifies one registration of a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// One registered subscription
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub qos: QoS,
    pub handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            id: self.id,
            topic: self.topic.clone(),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Registered subscriptions in registration order
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
    next_id: SubscriptionId,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `topic`; an existing registration of the same topic is
    /// replaced in place and returned
    pub fn insert(
        &mut self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> (SubscriptionHandle, Option<Subscription>) {
        self.next_id += 1;
        let subscription = Subscription {
            id: self.next_id,
            topic: topic.to_string(),
            qos,
            handler,
        };
        let handle = subscription.handle();

        let replaced = match self.entries.iter_mut().find(|entry| entry.topic == topic) {
            Some(existing) => Some(std::mem::replace(existing, subscription)),
            None => {
                self.entries.push(subscription);
                None
            }
        };

        (handle, replaced)
    }

    /// Remove the registration `handle` refers to; stale handles are ignored
    pub fn remove(&mut self, handle: &SubscriptionHandle) -> Option<Subscription> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id == handle.id && entry.topic == handle.topic)?;
        Some(self.entries.remove(index))
    }

    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.entries.iter().find(|entry| entry.topic == topic)
    }

    /// Subscriptions in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    /// Subscriptions whose filter matches a concrete topic
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.entries
            .iter()
            .filter(move |entry| topic_matches(topic, &entry.topic))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
