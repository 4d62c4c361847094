//! The three sink interfaces behind the progress channel.
//!
//! Each sink returns a typed [`SinkError`]; only
//! [`ProgressChannel`](super::ProgressChannel) decides to log and drop it.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;

use crate::core::{NewLogEntry, Order, OrderId, OrderStatus, StageLogEntry, StatusUpdate};
use crate::errors::SinkError;

/// The denormalized order status record.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts or replaces an order.
    async fn insert(&self, order: Order) -> Result<(), SinkError>;

    /// Reads an order.
    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, SinkError>;

    /// Applies a partial update and returns the updated order.
    async fn update(&self, order_id: OrderId, update: &StatusUpdate) -> Result<Order, SinkError>;

    /// Applies a partial update only if the order's status is one of
    /// `expected`, atomically with the check.
    ///
    /// Returns `Ok(None)` when the status did not match and nothing changed.
    async fn update_if(
        &self,
        order_id: OrderId,
        expected: &[OrderStatus],
        update: &StatusUpdate,
    ) -> Result<Option<Order>, SinkError>;
}

/// The append-only stage log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Appends an entry and returns it with its assigned identifier.
    async fn append(&self, entry: NewLogEntry) -> Result<StageLogEntry, SinkError>;

    /// All entries of an order in append order.
    async fn entries(&self, order_id: OrderId) -> Result<Vec<StageLogEntry>, SinkError>;
}

/// An order-scoped topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    order_id: OrderId,
    name: String,
}

impl Topic {
    /// The topic of an order under a prefix.
    #[must_use]
    pub fn for_order(prefix: &str, order_id: OrderId) -> Self {
        Self {
            order_id,
            name: format!("{prefix}{order_id}"),
        }
    }

    /// The order this topic belongs to.
    #[must_use]
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// The full topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Runs when a subscription is dropped, after its receiver is gone.
pub type ReleaseHook = Box<dyn FnOnce(&Topic) + Send + Sync>;

/// A live subscription to one topic.
///
/// Dropping the subscription unsubscribes.
pub struct TopicSubscription {
    topic: Topic,
    receiver: Option<broadcast::Receiver<String>>,
    on_release: Option<ReleaseHook>,
}

impl TopicSubscription {
    /// Wraps a broadcast receiver.
    #[must_use]
    pub fn new(topic: Topic, receiver: broadcast::Receiver<String>) -> Self {
        Self {
            topic,
            receiver: Some(receiver),
            on_release: None,
        }
    }

    /// Registers a hook the bus uses to forget topics nobody listens to.
    #[must_use]
    pub fn on_release(mut self, hook: ReleaseHook) -> Self {
        self.on_release = Some(hook);
        self
    }

    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Waits for the next message.
    pub async fn recv(&mut self) -> Result<String, broadcast::error::RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }

    /// Takes a buffered message without waiting.
    pub fn try_recv(&mut self) -> Result<String, broadcast::error::TryRecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.try_recv(),
            None => Err(broadcast::error::TryRecvError::Closed),
        }
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        drop(self.receiver.take());
        if let Some(hook) = self.on_release.take() {
            hook(&self.topic);
        }
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Live fan-out of progress payloads.
#[async_trait]
pub trait TopicBus: Send + Sync {
    /// Publishes a payload; returns the number of live subscribers reached.
    async fn publish(&self, topic: &Topic, payload: String) -> Result<usize, SinkError>;

    /// Subscribes to a topic.
    fn subscribe(&self, topic: &Topic) -> Result<TopicSubscription, SinkError>;

    /// Number of live subscribers on a topic.
    fn subscriber_count(&self, topic: &Topic) -> usize;
}
