//! Sinks that always fail, and a ready-made in-memory channel.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ChannelConfig;
use crate::core::{NewLogEntry, Order, OrderId, OrderStatus, StageLogEntry, StageName, StatusUpdate};
use crate::errors::{SinkError, SinkKind};
use crate::progress::{
    BroadcastTopicBus, InMemoryLogStore, InMemoryOrderStore, LogStore, OrderStore, ProgressChannel, Topic,
    TopicBus, TopicSubscription,
};

/// An order store that is always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingOrderStore;

#[async_trait]
impl OrderStore for FailingOrderStore {
    async fn insert(&self, order: Order) -> Result<(), SinkError> {
        Err(SinkError::new(SinkKind::Status, order.id, "status store offline"))
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, SinkError> {
        Err(SinkError::new(SinkKind::Status, order_id, "status store offline"))
    }

    async fn update(&self, order_id: OrderId, _update: &StatusUpdate) -> Result<Order, SinkError> {
        Err(SinkError::new(SinkKind::Status, order_id, "status store offline"))
    }

    async fn update_if(
        &self,
        order_id: OrderId,
        _expected: &[OrderStatus],
        _update: &StatusUpdate,
    ) -> Result<Option<Order>, SinkError> {
        Err(SinkError::new(SinkKind::Status, order_id, "status store offline"))
    }
}

/// An in-memory order store that cancels the order once, immediately
/// before the first write that moves it into `target` (optionally only
/// for one stage).
///
/// Reproduces a user cancel landing between a status read and the
/// following transition.
#[derive(Debug)]
pub struct CancelBeforeTransition {
    inner: Arc<InMemoryOrderStore>,
    target: OrderStatus,
    stage: Option<StageName>,
    fired: AtomicBool,
}

impl CancelBeforeTransition {
    /// Wraps `inner`, arming the cancel for writes into `target`.
    #[must_use]
    pub fn new(inner: Arc<InMemoryOrderStore>, target: OrderStatus) -> Self {
        Self {
            inner,
            target,
            stage: None,
            fired: AtomicBool::new(false),
        }
    }

    /// Only fires for writes that also set `stage`.
    #[must_use]
    pub fn for_stage(mut self, stage: StageName) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Whether the cancel has been injected.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    async fn maybe_cancel(&self, order_id: OrderId, update: &StatusUpdate) -> Result<(), SinkError> {
        let matches = update.status == Some(self.target)
            && self.stage.map_or(true, |stage| update.current_stage == Some(stage));
        if matches && !self.fired.swap(true, Ordering::SeqCst) {
            self.inner
                .update(order_id, &StatusUpdate::new().with_status(OrderStatus::Cancelled))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for CancelBeforeTransition {
    async fn insert(&self, order: Order) -> Result<(), SinkError> {
        self.inner.insert(order).await
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, SinkError> {
        self.inner.get(order_id).await
    }

    async fn update(&self, order_id: OrderId, update: &StatusUpdate) -> Result<Order, SinkError> {
        self.maybe_cancel(order_id, update).await?;
        self.inner.update(order_id, update).await
    }

    async fn update_if(
        &self,
        order_id: OrderId,
        expected: &[OrderStatus],
        update: &StatusUpdate,
    ) -> Result<Option<Order>, SinkError> {
        self.maybe_cancel(order_id, update).await?;
        self.inner.update_if(order_id, expected, update).await
    }
}

/// A log store that is always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingLogStore;

#[async_trait]
impl LogStore for FailingLogStore {
    async fn append(&self, entry: NewLogEntry) -> Result<StageLogEntry, SinkError> {
        Err(SinkError::new(SinkKind::Log, entry.order_id, "log store offline"))
    }

    async fn entries(&self, order_id: OrderId) -> Result<Vec<StageLogEntry>, SinkError> {
        Err(SinkError::new(SinkKind::Log, order_id, "log store offline"))
    }
}

/// A topic bus that is always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingTopicBus;

#[async_trait]
impl TopicBus for FailingTopicBus {
    async fn publish(&self, topic: &Topic, _payload: String) -> Result<usize, SinkError> {
        Err(SinkError::new(SinkKind::Topic, topic.order_id(), "broker offline"))
    }

    fn subscribe(&self, topic: &Topic) -> Result<TopicSubscription, SinkError> {
        Err(SinkError::new(SinkKind::Topic, topic.order_id(), "broker offline"))
    }

    fn subscriber_count(&self, _topic: &Topic) -> usize {
        0
    }
}

/// A channel over fresh in-memory sinks, returning the stores for inspection.
#[must_use]
pub fn test_channel() -> (ProgressChannel, Arc<InMemoryOrderStore>, Arc<InMemoryLogStore>) {
    let orders = Arc::new(InMemoryOrderStore::new());
    let logs = Arc::new(InMemoryLogStore::new());
    let channel = ProgressChannel::new(
        orders.clone(),
        logs.clone(),
        Arc::new(BroadcastTopicBus::default()),
        ChannelConfig::default(),
    );
    (channel, orders, logs)
}
