//! What a stage body sees while it runs.

use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::config::ProgressWindow;
use crate::core::{OrderId, OrderStatus, ProgressEvent, StageName};
use crate::errors::StageError;
use crate::fetch::BoundedFetcher;
use crate::progress::{round_pct, ProgressChannel};

/// Maps body fractions into the stage window and publishes them.
///
/// Reported percentages never decrease within one invocation.
#[derive(Clone)]
pub struct ProgressReporter {
    channel: ProgressChannel,
    order_id: OrderId,
    stage: StageName,
    window: ProgressWindow,
    last_pct: Arc<Mutex<f64>>,
}

impl ProgressReporter {
    /// Creates a reporter starting at 0%.
    #[must_use]
    pub fn new(channel: ProgressChannel, order_id: OrderId, stage: StageName, window: ProgressWindow) -> Self {
        Self {
            channel,
            order_id,
            stage,
            window,
            last_pct: Arc::new(Mutex::new(0.0)),
        }
    }

    /// The window fractions are mapped into.
    #[must_use]
    pub fn window(&self) -> ProgressWindow {
        self.window
    }

    /// The highest percentage reported so far.
    #[must_use]
    pub fn current_pct(&self) -> f64 {
        *self.last_pct.lock()
    }

    /// Raises the high-water mark to `pct` and returns the value to publish.
    fn advance(&self, pct: f64) -> f64 {
        let mut last = self.last_pct.lock();
        let next = round_pct(pct.max(*last));
        *last = next;
        next
    }

    /// Reports a `[0, 1]` fraction of the stage.
    pub async fn report(&self, fraction: f64, step: &str, message: &str) -> f64 {
        let pct = self.advance(self.window.map(fraction));
        let event = ProgressEvent::running(self.order_id, self.stage, step, pct, message);
        self.channel.publish(&event).await;
        pct
    }

    /// Publishes an event at an absolute percentage, clamped to the high-water mark.
    pub(crate) async fn emit(&self, mut event: ProgressEvent) {
        if event.has_progress() {
            event.progress_pct = self.advance(event.progress_pct);
        }
        self.channel.publish(&event).await;
    }
}

/// Context handed to a stage body.
///
/// Cheap to clone; every clone shares the same progress high-water mark.
#[derive(Clone)]
pub struct StageContext {
    order_id: OrderId,
    order_code: String,
    stage: StageName,
    output_dir: PathBuf,
    config: Arc<Value>,
    fetcher: Arc<BoundedFetcher>,
    channel: ProgressChannel,
    reporter: ProgressReporter,
}

impl StageContext {
    /// Creates a context.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: OrderId,
        order_code: impl Into<String>,
        stage: StageName,
        output_dir: PathBuf,
        config: Value,
        fetcher: Arc<BoundedFetcher>,
        channel: ProgressChannel,
        window: ProgressWindow,
    ) -> Self {
        let reporter = ProgressReporter::new(channel.clone(), order_id, stage, window);
        Self {
            order_id,
            order_code: order_code.into(),
            stage,
            output_dir,
            config: Arc::new(config),
            fetcher,
            channel,
            reporter,
        }
    }

    /// The order being processed.
    #[must_use]
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// The order code.
    #[must_use]
    pub fn order_code(&self) -> &str {
        &self.order_code
    }

    /// The running stage.
    #[must_use]
    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// The order's output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of a named artifact in the output directory.
    #[must_use]
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// The stage-specific dispatch configuration.
    #[must_use]
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// The shared external fetcher.
    #[must_use]
    pub fn fetcher(&self) -> &BoundedFetcher {
        &self.fetcher
    }

    /// The progress reporter.
    #[must_use]
    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// Reports a `[0, 1]` fraction of the stage.
    pub async fn report(&self, fraction: f64, step: &str, message: &str) -> f64 {
        self.reporter.report(fraction, step, message).await
    }

    /// Fails with [`StageError::Cancelled`] if the order has been cancelled.
    ///
    /// An unreadable status record is treated as "not cancelled".
    pub async fn checkpoint(&self) -> Result<(), StageError> {
        match self.channel.order(self.order_id).await {
            Ok(Some(order)) if order.status == OrderStatus::Cancelled => Err(StageError::Cancelled {
                order_id: self.order_id,
                stage: self.stage,
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(order_id = self.order_id, error = %e, "Checkpoint could not read order status");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("order_id", &self.order_id)
            .field("stage", &self.stage)
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}
