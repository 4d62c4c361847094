//! In-process sink implementations.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::sinks::{LogStore, OrderStore, Topic, TopicBus, TopicSubscription};
use crate::core::{NewLogEntry, Order, OrderId, OrderStatus, StageLogEntry, StatusUpdate};
use crate::errors::{SinkError, SinkKind};

/// Order store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<OrderId, Order>,
}

impl InMemoryOrderStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of an order.
    #[must_use]
    pub fn snapshot(&self, order_id: OrderId) -> Option<Order> {
        self.orders.get(&order_id).map(|order| order.clone())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: Order) -> Result<(), SinkError> {
        self.orders.insert(order.id, order);
        Ok(())
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, SinkError> {
        Ok(self.snapshot(order_id))
    }

    async fn update(&self, order_id: OrderId, update: &StatusUpdate) -> Result<Order, SinkError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| SinkError::unknown_order(SinkKind::Status, order_id))?;
        update.apply(&mut order);
        Ok(order.clone())
    }

    async fn update_if(
        &self,
        order_id: OrderId,
        expected: &[OrderStatus],
        update: &StatusUpdate,
    ) -> Result<Option<Order>, SinkError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| SinkError::unknown_order(SinkKind::Status, order_id))?;
        if !expected.contains(&order.status) {
            debug!(order_id, status = %order.status, "Conditional update refused");
            return Ok(None);
        }
        update.apply(&mut order);
        Ok(Some(order.clone()))
    }
}

/// Append-only log kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    entries: RwLock<Vec<StageLogEntry>>,
    next_id: AtomicU64,
}

impl InMemoryLogStore {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry across all orders.
    #[must_use]
    pub fn all(&self) -> Vec<StageLogEntry> {
        self.entries.read().clone()
    }

    /// Entries of one order.
    #[must_use]
    pub fn for_order(&self, order_id: OrderId) -> Vec<StageLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, entry: NewLogEntry) -> Result<StageLogEntry, SinkError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = entry.into_entry(id);
        self.entries.write().push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self, order_id: OrderId) -> Result<Vec<StageLogEntry>, SinkError> {
        Ok(self.for_order(order_id))
    }
}

/// Topic bus over tokio broadcast channels, one per topic.
///
/// Subscribers that fall more than `capacity` messages behind skip the
/// oldest ones. A topic's channel is dropped once its last subscriber
/// goes away.
#[derive(Debug)]
pub struct BroadcastTopicBus {
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl BroadcastTopicBus {
    /// Creates a bus with the given per-topic buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of topics with a live channel.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

fn release_idle(topics: &DashMap<String, broadcast::Sender<String>>, topic: &Topic) {
    if topics
        .remove_if(topic.name(), |_, sender| sender.receiver_count() == 0)
        .is_some()
    {
        debug!(topic = %topic, "Released idle topic");
    }
}

impl Default for BroadcastTopicBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl TopicBus for BroadcastTopicBus {
    async fn publish(&self, topic: &Topic, payload: String) -> Result<usize, SinkError> {
        let Some(sender) = self.topics.get(topic.name()).map(|s| s.clone()) else {
            debug!(topic = %topic, "No subscribers");
            return Ok(0);
        };
        match sender.send(payload) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                release_idle(&self.topics, topic);
                Ok(0)
            }
        }
    }

    fn subscribe(&self, topic: &Topic) -> Result<TopicSubscription, SinkError> {
        // Subscribing under the entry lock keeps a concurrent release from
        // dropping the channel in between.
        let receiver = self
            .topics
            .entry(topic.name().to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(topic = %topic, "Subscribed");
        let topics = Arc::downgrade(&self.topics);
        Ok(TopicSubscription::new(topic.clone(), receiver).on_release(Box::new(move |topic: &Topic| {
            if let Some(topics) = topics.upgrade() {
                release_idle(&topics, topic);
            }
        })))
    }

    fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic.name())
            .map_or(0, |sender| sender.receiver_count())
    }
}
