//! The order record read and written by the orchestration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OrderStatus, StageName};

/// Identifier of an order.
pub type OrderId = i64;

/// One end-to-end unit of analysis work.
///
/// Only the status/progress fields live here; everything else about an
/// order belongs to the surrounding application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// The order identifier.
    pub id: OrderId,
    /// Human-readable code, also the name of the order's output directory.
    pub code: String,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// The stage that is (or was last) current.
    pub current_stage: Option<StageName>,
    /// Progress percentage in `[0, 100]`.
    pub progress_pct: f64,
    /// Short description of the current step.
    pub stage_detail: String,
    /// Truncated failure message.
    pub error_message: Option<String>,
    /// When the order was created.
    pub created_at: DateTime<Utc>,
    /// When the order was last touched.
    pub updated_at: DateTime<Utc>,
    /// When the order last reached `completed` or `failed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Creates a new pending order.
    #[must_use]
    pub fn new(id: OrderId, code: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            code: code.into(),
            status: OrderStatus::Pending,
            current_stage: None,
            progress_pct: 0.0,
            stage_detail: String::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Sets the status, stamping `completed_at` for finished orders.
    pub fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
        if matches!(status, OrderStatus::Completed | OrderStatus::Failed) {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Refreshes `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A partial update applied to an order's status record.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// New lifecycle status.
    pub status: Option<OrderStatus>,
    /// New current stage.
    pub current_stage: Option<StageName>,
    /// New progress percentage.
    pub progress_pct: Option<f64>,
    /// New stage detail text.
    pub stage_detail: Option<String>,
    /// New error message; `Some(None)` clears it.
    pub error_message: Option<Option<String>>,
}

impl StatusUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the current stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageName) -> Self {
        self.current_stage = Some(stage);
        self
    }

    /// Sets the progress percentage.
    #[must_use]
    pub fn with_progress(mut self, pct: f64) -> Self {
        self.progress_pct = Some(pct);
        self
    }

    /// Sets the stage detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.stage_detail = Some(detail.into());
        self
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    /// Clears the error message.
    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    /// Applies the update to an order.
    pub fn apply(&self, order: &mut Order) {
        if let Some(status) = self.status {
            order.set_status(status);
        }
        if let Some(stage) = self.current_stage {
            order.current_stage = Some(stage);
        }
        if let Some(pct) = self.progress_pct {
            order.progress_pct = pct;
        }
        if let Some(ref detail) = self.stage_detail {
            order.stage_detail.clone_from(detail);
        }
        if let Some(ref error) = self.error_message {
            order.error_message.clone_from(error);
        }
        order.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_order_is_pending() {
        let order = Order::new(1, "ORD-1");
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.progress_pct, 0.0);
        assert!(order.completed_at.is_none());
    }

    #[test]
    fn test_status_update_apply() {
        let mut order = Order::new(1, "ORD-1");
        StatusUpdate::new()
            .with_status(OrderStatus::Stage1)
            .with_stage(StageName::Preprocessing)
            .with_progress(12.5)
            .with_detail("loading")
            .apply(&mut order);

        assert_eq!(order.status, OrderStatus::Stage1);
        assert_eq!(order.current_stage, Some(StageName::Preprocessing));
        assert_eq!(order.progress_pct, 12.5);
        assert_eq!(order.stage_detail, "loading");
    }

    #[test]
    fn test_failed_status_stamps_completion() {
        let mut order = Order::new(1, "ORD-1");
        StatusUpdate::new()
            .with_status(OrderStatus::Failed)
            .with_error("boom")
            .apply(&mut order);

        assert!(order.completed_at.is_some());
        assert_eq!(order.error_message.as_deref(), Some("boom"));

        StatusUpdate::new().clear_error().apply(&mut order);
        assert!(order.error_message.is_none());
    }
}
