//! Idempotent, crash-safe execution of one stage.

use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use super::{StageBody, StageContext};
use crate::config::OrchestratorConfig;
use crate::core::{OrderId, OrderStatus, ProgressEvent, StageManifest, StageName, StatusUpdate};
use crate::errors::{truncate_message, StageError};
use crate::fetch::BoundedFetcher;
use crate::observability::{order_span, SpanTimer};
use crate::progress::ProgressChannel;

/// How a stage run ended successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The body ran to completion.
    Completed,
    /// Every expected artifact already existed; the body did not run.
    Cached,
}

/// One requested execution of a stage.
#[derive(Debug, Clone)]
pub struct StageInvocation {
    /// The order.
    pub order_id: OrderId,
    /// The stage.
    pub stage: StageName,
    /// Opaque stage configuration handed to the body.
    pub config: Value,
    /// Upstream artifacts that must exist before the body runs.
    pub required_inputs: Vec<String>,
}

impl StageInvocation {
    /// Creates an invocation with no configuration.
    #[must_use]
    pub fn new(order_id: OrderId, stage: StageName) -> Self {
        Self {
            order_id,
            stage,
            config: Value::Null,
            required_inputs: Vec::new(),
        }
    }

    /// Sets the stage configuration.
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Sets the required upstream inputs.
    #[must_use]
    pub fn with_required_inputs(mut self, inputs: &[String]) -> Self {
        self.required_inputs = inputs.to_vec();
        self
    }
}

/// Wraps stage bodies with the idempotency check, progress mapping, and
/// uniform success/failure/cancel handling.
#[derive(Clone)]
pub struct StageRunner {
    config: Arc<OrchestratorConfig>,
    channel: ProgressChannel,
    fetcher: Arc<BoundedFetcher>,
}

impl StageRunner {
    /// Creates a runner.
    pub fn new(config: Arc<OrchestratorConfig>, channel: ProgressChannel, fetcher: Arc<BoundedFetcher>) -> Self {
        Self {
            config,
            channel,
            fetcher,
        }
    }

    /// Runs one stage of one order.
    ///
    /// Failures are persisted (status + failed log entry) before the error
    /// is returned, so the caller's retry policy sees an already-recorded
    /// failure.
    pub async fn run_stage(
        &self,
        invocation: StageInvocation,
        body: &dyn StageBody,
        expected_outputs: &StageManifest,
    ) -> Result<StageOutcome, StageError> {
        let span = order_span(invocation.order_id, invocation.stage);
        self.run_stage_inner(invocation, body, expected_outputs)
            .instrument(span)
            .await
    }

    async fn run_stage_inner(
        &self,
        invocation: StageInvocation,
        body: &dyn StageBody,
        expected_outputs: &StageManifest,
    ) -> Result<StageOutcome, StageError> {
        let StageInvocation {
            order_id,
            stage,
            config,
            required_inputs,
        } = invocation;

        let order = self
            .channel
            .order(order_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| StageError::Precondition {
                stage,
                message: format!("order {order_id} not found"),
            })?;

        if order.status == OrderStatus::Cancelled {
            return Err(self.skip(order_id, stage, "Order cancelled before stage start").await);
        }

        let output_dir = self.config.order_dir(&order.code);
        if expected_outputs.is_satisfied(&output_dir).await {
            info!(body = body.name(), "All outputs present, skipping stage");
            let event = ProgressEvent::completed(order_id, stage, "complete", 100.0, format!("{stage} completed (cached)"))
                .with_metadata("cached", json!(true));
            self.channel.publish(&event).await;
            return Ok(StageOutcome::Cached);
        }

        let window = self.config.stages.window(stage);
        let started = self
            .channel
            .update_status_if(
                order_id,
                &OrderStatus::RUNNABLE,
                StatusUpdate::new()
                    .with_status(stage.running_status())
                    .with_stage(stage)
                    .with_progress(0.0)
                    .with_detail(format!("Starting {stage}"))
                    .clear_error(),
            )
            .await;
        match started {
            Ok(Some(_)) => {}
            Ok(None) => return Err(self.skip(order_id, stage, "Order cancelled before stage start").await),
            Err(e) => warn!(error = %e, "Could not mark stage running, continuing"),
        }

        let ctx = StageContext::new(
            order_id,
            order.code.clone(),
            stage,
            output_dir.clone(),
            config,
            self.fetcher.clone(),
            self.channel.clone(),
            window,
        );
        ctx.reporter()
            .emit(ProgressEvent::started(order_id, stage, 0.0, format!("Starting {stage}")))
            .await;

        let timer = SpanTimer::start(stage.as_str());
        let result = match prepare(&ctx, &required_inputs).await {
            Ok(()) => AssertUnwindSafe(body.run(&ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(anyhow::anyhow!("stage body panicked: {}", panic_message(&*panic)))),
            Err(e) => Err(e.into()),
        };
        let duration_ms = timer.finish();

        let err = match result {
            Ok(()) => {
                let event = ProgressEvent::completed(order_id, stage, "complete", window.terminal, format!("{stage} complete"))
                    .with_metadata("duration_ms", json!(duration_ms));
                ctx.reporter().emit(event).await;
                info!(body = body.name(), duration_ms, "Stage completed");
                return Ok(StageOutcome::Completed);
            }
            Err(e) => e,
        };

        if is_cancellation(&err) || self.is_cancelled(order_id).await {
            return Err(self.skip(order_id, stage, "Order cancelled during stage").await);
        }
        Err(self.fail(order_id, stage, err, duration_ms).await)
    }

    async fn fail(&self, order_id: OrderId, stage: StageName, source: anyhow::Error, duration_ms: u64) -> StageError {
        let err = match source.downcast::<StageError>() {
            Ok(stage_error) => stage_error,
            Err(source) => StageError::Body { stage, source },
        };
        let message = truncate_message(&err.to_string(), self.channel.config().error_message_max_len);
        error!(error = %message, "Stage failed");

        self.channel
            .try_update_status(
                order_id,
                StatusUpdate::new()
                    .with_status(OrderStatus::Failed)
                    .with_error(message.clone()),
            )
            .await;
        let event = ProgressEvent::failed(order_id, stage, message)
            .with_metadata("traceback", json!(err.trace()))
            .with_metadata("duration_ms", json!(duration_ms));
        self.channel.publish(&event).await;
        err
    }

    async fn skip(&self, order_id: OrderId, stage: StageName, message: &str) -> StageError {
        warn!(message, "Stage skipped");
        let event = ProgressEvent::skipped(order_id, stage, "cancelled", message);
        self.channel.publish(&event).await;
        StageError::Cancelled { order_id, stage }
    }

    async fn is_cancelled(&self, order_id: OrderId) -> bool {
        matches!(
            self.channel.order(order_id).await,
            Ok(Some(order)) if order.status == OrderStatus::Cancelled
        )
    }
}

async fn prepare(ctx: &StageContext, required_inputs: &[String]) -> Result<(), StageError> {
    for name in required_inputs {
        let present = tokio::fs::metadata(ctx.artifact_path(name))
            .await
            .is_ok_and(|meta| meta.is_file() && meta.len() > 0);
        if !present {
            return Err(StageError::Precondition {
                stage: ctx.stage(),
                message: format!("required input '{name}' is missing"),
            });
        }
    }
    tokio::fs::create_dir_all(ctx.output_dir())
        .await
        .map_err(|source| StageError::Artifact {
            stage: ctx.stage(),
            source,
        })
}

fn is_cancellation(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<StageError>()
        .is_some_and(StageError::is_cancelled)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
