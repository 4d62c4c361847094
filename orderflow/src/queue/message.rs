//! The stage dispatch message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{OrderId, StageName};

/// Config key controlling whether the next stage is dispatched on success.
pub const CHAIN_TO_NEXT: &str = "chain_to_next";

/// A request to run one stage of one order.
///
/// `config` is opaque to the orchestration core apart from the
/// [`CHAIN_TO_NEXT`] flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    /// Unique id of this dispatch.
    pub task_id: Uuid,
    /// The order.
    pub order_id: OrderId,
    /// The stage to run.
    pub stage: StageName,
    /// Stage-specific configuration.
    #[serde(default)]
    pub config: Value,
    /// Delivery attempt, starting at 0.
    #[serde(default)]
    pub attempt: u32,
    /// When the message was created.
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchMessage {
    /// Creates a first-attempt message.
    #[must_use]
    pub fn new(order_id: OrderId, stage: StageName, config: Value) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            order_id,
            stage,
            config,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Sets the chaining flag, turning a non-object config into an object.
    #[must_use]
    pub fn with_chain_to_next(mut self, chain: bool) -> Self {
        if !self.config.is_object() {
            self.config = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.config {
            map.insert(CHAIN_TO_NEXT.to_string(), Value::Bool(chain));
        }
        self
    }

    /// Whether the next stage should be dispatched after this one succeeds.
    #[must_use]
    pub fn chain_to_next(&self) -> bool {
        self.config
            .get(CHAIN_TO_NEXT)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// The message for the following stage, carrying the same config.
    #[must_use]
    pub fn follow_up(&self, stage: StageName) -> Self {
        Self::new(self.order_id, stage, self.config.clone())
    }

    /// The queue this message belongs on.
    #[must_use]
    pub fn queue_name(&self) -> &'static str {
        self.stage.queue_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_defaults_to_true() {
        let msg = DispatchMessage::new(1, StageName::Preprocessing, Value::Null);
        assert!(msg.chain_to_next());
        assert_eq!(msg.queue_name(), "preprocessing");
    }

    #[test]
    fn test_with_chain_to_next_keeps_existing_keys() {
        let msg = DispatchMessage::new(1, StageName::RagEnrichment, json!({"organism": "human"}))
            .with_chain_to_next(false);

        assert!(!msg.chain_to_next());
        assert_eq!(msg.config["organism"], "human");
    }

    #[test]
    fn test_follow_up_is_a_new_task() {
        let msg = DispatchMessage::new(7, StageName::Preprocessing, json!({"k": 1}));
        let next = msg.follow_up(StageName::RagEnrichment);

        assert_ne!(next.task_id, msg.task_id);
        assert_eq!(next.order_id, 7);
        assert_eq!(next.config, msg.config);
        assert_eq!(next.attempt, 0);
    }

    #[test]
    fn test_wire_form() {
        let msg = DispatchMessage::new(3, StageName::ReportGeneration, json!({}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["stage"], "report_generation");
        assert_eq!(value["order_id"], 3);
    }
}
