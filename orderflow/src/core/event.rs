//! Progress events and the immutable log entries they become.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{LogStatus, OrderId, StageName};

/// Sentinel percentage for events where progress is not meaningful.
pub const FAILED_PCT: f64 = -1.0;

/// A transient status update for one order's stage.
///
/// This is the payload published on the order topic and forwarded by the
/// streaming gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The order.
    pub order_id: OrderId,
    /// The stage.
    pub stage: StageName,
    /// The step within the stage (e.g. "start", "enrichment", "error").
    pub step: String,
    /// Event status.
    pub status: LogStatus,
    /// Percentage in `[0, 100]`, or [`FAILED_PCT`].
    pub progress_pct: f64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Structured metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ProgressEvent {
    /// Creates a new progress event.
    #[must_use]
    pub fn new(
        order_id: OrderId,
        stage: StageName,
        step: impl Into<String>,
        status: LogStatus,
        progress_pct: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            order_id,
            stage,
            step: step.into(),
            status,
            progress_pct,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    /// Creates a "started" event.
    #[must_use]
    pub fn started(order_id: OrderId, stage: StageName, pct: f64, message: impl Into<String>) -> Self {
        Self::new(order_id, stage, "start", LogStatus::Started, pct, message)
    }

    /// Creates a "running" event.
    #[must_use]
    pub fn running(
        order_id: OrderId,
        stage: StageName,
        step: impl Into<String>,
        pct: f64,
        message: impl Into<String>,
    ) -> Self {
        Self::new(order_id, stage, step, LogStatus::Running, pct, message)
    }

    /// Creates a "completed" event.
    #[must_use]
    pub fn completed(
        order_id: OrderId,
        stage: StageName,
        step: impl Into<String>,
        pct: f64,
        message: impl Into<String>,
    ) -> Self {
        Self::new(order_id, stage, step, LogStatus::Completed, pct, message)
    }

    /// Creates a "failed" event at the sentinel percentage.
    #[must_use]
    pub fn failed(order_id: OrderId, stage: StageName, message: impl Into<String>) -> Self {
        Self::new(order_id, stage, "error", LogStatus::Failed, FAILED_PCT, message)
    }

    /// Creates a "skipped" event.
    #[must_use]
    pub fn skipped(
        order_id: OrderId,
        stage: StageName,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(order_id, stage, step, LogStatus::Skipped, FAILED_PCT, message)
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the percentage carries meaning.
    #[must_use]
    pub fn has_progress(&self) -> bool {
        self.progress_pct >= 0.0
    }

    /// Serializes the event to its JSON wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An immutable, append-only record of one progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLogEntry {
    /// Monotonic identifier assigned by the log store.
    pub id: u64,
    /// The order.
    pub order_id: OrderId,
    /// The stage.
    pub stage: StageName,
    /// The step.
    pub step: String,
    /// The status.
    pub status: LogStatus,
    /// Percentage; `None` for the failure sentinel.
    pub progress_pct: Option<f64>,
    /// Message, truncated to the configured maximum.
    pub message: String,
    /// Structured metadata, if any.
    pub metadata: Option<serde_json::Value>,
    /// Duration of the step in milliseconds, if measured.
    pub duration_ms: Option<u64>,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// A log entry before the store assigns its identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    /// The order.
    pub order_id: OrderId,
    /// The stage.
    pub stage: StageName,
    /// The step.
    pub step: String,
    /// The status.
    pub status: LogStatus,
    /// Percentage; `None` for the failure sentinel.
    pub progress_pct: Option<f64>,
    /// Message.
    pub message: String,
    /// Structured metadata, if any.
    pub metadata: Option<serde_json::Value>,
    /// Duration in milliseconds, if measured.
    pub duration_ms: Option<u64>,
}

impl NewLogEntry {
    /// Builds a log entry from a progress event.
    #[must_use]
    pub fn from_event(event: &ProgressEvent, max_message_len: usize) -> Self {
        let metadata = if event.metadata.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(
                event.metadata.clone().into_iter().collect(),
            ))
        };
        let duration_ms = event
            .metadata
            .get("duration_ms")
            .and_then(serde_json::Value::as_u64);

        Self {
            order_id: event.order_id,
            stage: event.stage,
            step: event.step.clone(),
            status: event.status,
            progress_pct: event.has_progress().then_some(event.progress_pct),
            message: crate::errors::truncate_message(&event.message, max_message_len),
            metadata,
            duration_ms,
        }
    }

    /// Freezes the entry with its identifier and creation time.
    #[must_use]
    pub fn into_entry(self, id: u64) -> StageLogEntry {
        StageLogEntry {
            id,
            order_id: self.order_id,
            stage: self.stage,
            step: self.step,
            status: self.status,
            progress_pct: self.progress_pct,
            message: self.message,
            metadata: self.metadata,
            duration_ms: self.duration_ms,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_failed_event_uses_sentinel() {
        let event = ProgressEvent::failed(1, StageName::RagEnrichment, "boom");
        assert_eq!(event.progress_pct, FAILED_PCT);
        assert!(!event.has_progress());
        assert_eq!(event.step, "error");
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ProgressEvent::running(9, StageName::Preprocessing, "quant", 12.5, "working")
            .with_metadata("rows", serde_json::json!(40));
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["order_id"], 9);
        assert_eq!(value["stage"], "preprocessing");
        assert_eq!(value["status"], "running");
        assert_eq!(value["progress_pct"], 12.5);
        assert_eq!(value["metadata"]["rows"], 40);
    }

    #[test]
    fn test_log_entry_from_event() {
        let event = ProgressEvent::failed(3, StageName::ReportGeneration, "x".repeat(50))
            .with_metadata("duration_ms", serde_json::json!(1200));
        let entry = NewLogEntry::from_event(&event, 10).into_entry(42);

        assert_eq!(entry.id, 42);
        assert_eq!(entry.progress_pct, None);
        assert_eq!(entry.message.len(), 10);
        assert_eq!(entry.duration_ms, Some(1200));
        assert!(entry.metadata.is_some());
    }

    #[test]
    fn test_log_entry_without_metadata() {
        let event = ProgressEvent::started(3, StageName::Preprocessing, 0.0, "go");
        let entry = NewLogEntry::from_event(&event, 2000);

        assert_eq!(entry.progress_pct, Some(0.0));
        assert!(entry.metadata.is_none());
        assert!(entry.duration_ms.is_none());
    }
}
