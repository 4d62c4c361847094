//! Fan-out of progress events to the status record, the stage log, and the
//! order topic.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::sinks::{LogStore, OrderStore, Topic, TopicBus, TopicSubscription};
use crate::config::ChannelConfig;
use crate::core::{NewLogEntry, Order, OrderId, OrderStatus, ProgressEvent, StageLogEntry, StatusUpdate};
use crate::errors::{truncate_message, SinkError, SinkKind};

/// What happened to one sink during a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkOutcome {
    /// The sink accepted the write.
    Written,
    /// The sink was intentionally not written.
    Skipped,
    /// The sink failed; the error was logged and dropped.
    Failed,
}

/// Per-sink outcome of one [`ProgressChannel::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    /// Status record update.
    pub status: SinkOutcome,
    /// Log append.
    pub log: SinkOutcome,
    /// Topic publish.
    pub topic: SinkOutcome,
}

impl PublishReport {
    /// Whether every attempted sink succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        ![self.status, self.log, self.topic].contains(&SinkOutcome::Failed)
    }
}

/// Publishes progress events to three independent sinks.
///
/// No sink failure ever reaches the caller.
#[derive(Clone)]
pub struct ProgressChannel {
    orders: Arc<dyn OrderStore>,
    logs: Arc<dyn LogStore>,
    bus: Arc<dyn TopicBus>,
    config: ChannelConfig,
}

impl ProgressChannel {
    /// Creates a channel.
    pub fn new(
        orders: Arc<dyn OrderStore>,
        logs: Arc<dyn LogStore>,
        bus: Arc<dyn TopicBus>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            orders,
            logs,
            bus,
            config,
        }
    }

    /// The channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The topic of an order.
    #[must_use]
    pub fn topic(&self, order_id: OrderId) -> Topic {
        Topic::for_order(&self.config.topic_prefix, order_id)
    }

    /// Publishes an event: status update, then log append, then topic.
    pub async fn publish(&self, event: &ProgressEvent) -> PublishReport {
        let status = if event.has_progress() {
            let update = StatusUpdate::new()
                .with_stage(event.stage)
                .with_progress(round_pct(event.progress_pct))
                .with_detail(truncate_message(&event.message, self.config.stage_detail_max_len));
            match self.orders.update(event.order_id, &update).await {
                Ok(_) => SinkOutcome::Written,
                Err(e) => discard(&e),
            }
        } else {
            SinkOutcome::Skipped
        };

        let entry = NewLogEntry::from_event(event, self.config.message_max_len);
        let log = match self.logs.append(entry).await {
            Ok(_) => SinkOutcome::Written,
            Err(e) => discard(&e),
        };

        let topic = match event.to_json() {
            Ok(payload) => match self.bus.publish(&self.topic(event.order_id), payload).await {
                Ok(receivers) => {
                    debug!(order_id = event.order_id, receivers, "Published progress");
                    SinkOutcome::Written
                }
                Err(e) => discard(&e),
            },
            Err(e) => discard(&SinkError::new(SinkKind::Topic, event.order_id, e.to_string())),
        };

        PublishReport { status, log, topic }
    }

    /// Applies a status update, returning the typed error to the caller.
    pub async fn update_status(&self, order_id: OrderId, update: StatusUpdate) -> Result<Order, SinkError> {
        self.orders.update(order_id, &self.truncate_error(update)).await
    }

    /// Applies a status update only while the order is in one of `expected`.
    ///
    /// `Ok(None)` means another writer moved the order first.
    pub async fn update_status_if(
        &self,
        order_id: OrderId,
        expected: &[OrderStatus],
        update: StatusUpdate,
    ) -> Result<Option<Order>, SinkError> {
        self.orders
            .update_if(order_id, expected, &self.truncate_error(update))
            .await
    }

    fn truncate_error(&self, mut update: StatusUpdate) -> StatusUpdate {
        if let Some(Some(message)) = update.error_message.as_mut() {
            *message = truncate_message(message, self.config.error_message_max_len);
        }
        update
    }

    /// Applies a status update, logging and dropping any failure.
    pub async fn try_update_status(&self, order_id: OrderId, update: StatusUpdate) -> SinkOutcome {
        match self.update_status(order_id, update).await {
            Ok(_) => SinkOutcome::Written,
            Err(e) => discard(&e),
        }
    }

    /// Reads an order.
    pub async fn order(&self, order_id: OrderId) -> Result<Option<Order>, SinkError> {
        self.orders.get(order_id).await
    }

    /// Reads an order's log history.
    pub async fn history(&self, order_id: OrderId) -> Result<Vec<StageLogEntry>, SinkError> {
        self.logs.entries(order_id).await
    }

    /// Subscribes to an order's topic.
    pub fn subscribe(&self, order_id: OrderId) -> Result<TopicSubscription, SinkError> {
        self.bus.subscribe(&self.topic(order_id))
    }

    /// Number of live subscribers on an order's topic.
    #[must_use]
    pub fn subscriber_count(&self, order_id: OrderId) -> usize {
        self.bus.subscriber_count(&self.topic(order_id))
    }
}

fn discard(error: &SinkError) -> SinkOutcome {
    warn!(
        sink = %error.sink,
        order_id = error.order_id,
        error = %error.message,
        "Progress sink failed, continuing"
    );
    SinkOutcome::Failed
}

/// Rounds a percentage to one decimal.
#[must_use]
pub fn round_pct(pct: f64) -> f64 {
    (pct * 10.0).round() / 10.0
}
