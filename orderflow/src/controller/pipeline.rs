//! Start, chain, re-run, and cancel orders.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cancellation::CancellationToken;
use crate::config::OrchestratorConfig;
use crate::core::{
    LogStatus, ManifestSet, Order, OrderId, OrderStatus, ProgressEvent, StageLogEntry, StageName, StatusUpdate,
};
use crate::errors::{ControllerError, StageError};
use crate::fetch::BoundedFetcher;
use crate::progress::ProgressChannel;
use crate::queue::{DispatchMessage, InMemoryStageQueue, StageExecutor, StageQueue, Worker};
use crate::runner::{StageBody, StageInvocation, StageOutcome, StageRunner};

/// Owns the order lifecycle across the three stages.
///
/// The controller never runs a stage inline: every stage goes through the
/// queue, and chaining happens only after the runner has emitted the
/// stage's terminal event.
pub struct PipelineController {
    config: Arc<OrchestratorConfig>,
    channel: ProgressChannel,
    runner: StageRunner,
    queue: Arc<dyn StageQueue>,
    bodies: HashMap<StageName, Arc<dyn StageBody>>,
    manifests: ManifestSet,
}

impl PipelineController {
    /// Creates a controller with no stage bodies registered.
    pub fn new(
        config: OrchestratorConfig,
        channel: ProgressChannel,
        fetcher: Arc<BoundedFetcher>,
        queue: Arc<dyn StageQueue>,
    ) -> Self {
        let config = Arc::new(config);
        let runner = StageRunner::new(config.clone(), channel.clone(), fetcher);
        Self {
            config,
            channel,
            runner,
            queue,
            bodies: HashMap::new(),
            manifests: ManifestSet::new(),
        }
    }

    /// Registers the body of a stage.
    #[must_use]
    pub fn with_body(mut self, stage: StageName, body: Arc<dyn StageBody>) -> Self {
        self.bodies.insert(stage, body);
        self
    }

    /// Sets the artifact manifests and required inputs of every stage.
    #[must_use]
    pub fn with_manifests(mut self, manifests: ManifestSet) -> Self {
        self.manifests = manifests;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The progress channel.
    #[must_use]
    pub fn channel(&self) -> &ProgressChannel {
        &self.channel
    }

    /// The stage manifests.
    #[must_use]
    pub fn manifests(&self) -> &ManifestSet {
        &self.manifests
    }

    /// Reads an order.
    pub async fn order(&self, order_id: OrderId) -> Result<Order, ControllerError> {
        self.channel
            .order(order_id)
            .await?
            .ok_or(ControllerError::OrderNotFound(order_id))
    }

    /// Reads an order's stage log.
    pub async fn history(&self, order_id: OrderId) -> Result<Vec<StageLogEntry>, ControllerError> {
        Ok(self.channel.history(order_id).await?)
    }

    /// Starts (or restarts) the full pipeline at the first stage.
    ///
    /// Restarting a completed or cancelled order removes every stage's
    /// artifacts first. Restarting a failed order keeps them, so stages
    /// that already finished are skipped by the runner.
    pub async fn start_order(&self, order_id: OrderId, config: Value) -> Result<DispatchMessage, ControllerError> {
        let order = self.order(order_id).await?;
        if !order.status.can_start() {
            return Err(ControllerError::invalid_transition(order_id, order.status, "start"));
        }
        let first = StageName::first();
        self.ensure_body(first)?;

        if matches!(order.status, OrderStatus::Completed | OrderStatus::Cancelled) {
            let dir = self.config.order_dir(&order.code);
            for manifest in self.manifests.iter() {
                manifest
                    .invalidate(&dir)
                    .await
                    .map_err(|e| ControllerError::Invalidation {
                        stage: manifest.stage(),
                        message: e.to_string(),
                    })?;
            }
        }

        self.channel
            .update_status(
                order_id,
                StatusUpdate::new()
                    .with_status(OrderStatus::Queued)
                    .with_stage(first)
                    .with_progress(0.0)
                    .with_detail(format!("Queued for {first}"))
                    .clear_error(),
            )
            .await?;
        self.record_dispatch(order_id, first, "Pipeline started").await;
        info!(order_id, from = %order.status, "Order started");

        let message = DispatchMessage::new(order_id, first, config);
        self.queue.enqueue(message.clone()).await?;
        Ok(message)
    }

    /// Re-runs one stage without touching any other stage's artifacts.
    ///
    /// The stage's own artifacts are removed first and the dispatch does
    /// not chain into the following stage.
    pub async fn rerun_stage(
        &self,
        order_id: OrderId,
        stage: StageName,
        config: Value,
    ) -> Result<DispatchMessage, ControllerError> {
        let order = self.order(order_id).await?;
        if !order.status.can_rerun() {
            return Err(ControllerError::invalid_transition(order_id, order.status, "re-run"));
        }
        self.ensure_body(stage)?;

        let dir = self.config.order_dir(&order.code);
        if let Some(artifact) = self.manifests.first_missing_input(stage, &dir).await {
            let err = ControllerError::MissingUpstream { stage, artifact };
            self.channel
                .try_update_status(
                    order_id,
                    StatusUpdate::new()
                        .with_status(OrderStatus::Failed)
                        .with_stage(stage)
                        .with_error(err.to_string()),
                )
                .await;
            return Err(err);
        }

        let removed = self
            .manifests
            .get_or_empty(stage)
            .invalidate(&dir)
            .await
            .map_err(|e| ControllerError::Invalidation {
                stage,
                message: e.to_string(),
            })?;

        self.channel
            .update_status(
                order_id,
                StatusUpdate::new()
                    .with_status(OrderStatus::Queued)
                    .with_stage(stage)
                    .with_progress(0.0)
                    .with_detail(format!("Re-running {stage}"))
                    .clear_error(),
            )
            .await?;
        self.record_dispatch(order_id, stage, &format!("Re-running {stage}")).await;
        info!(order_id, stage = %stage, removed = removed.len(), "Stage re-run requested");

        let message = DispatchMessage::new(order_id, stage, config).with_chain_to_next(false);
        self.queue.enqueue(message.clone()).await?;
        Ok(message)
    }

    /// Cancels a queued or running order.
    ///
    /// A running stage observes this at its next checkpoint.
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<Order, ControllerError> {
        let order = self.order(order_id).await?;
        if !order.status.can_cancel() {
            return Err(ControllerError::invalid_transition(order_id, order.status, "cancel"));
        }
        let cancelled = self
            .channel
            .update_status_if(
                order_id,
                &OrderStatus::CANCELLABLE,
                StatusUpdate::new()
                    .with_status(OrderStatus::Cancelled)
                    .with_detail("Cancelled by user"),
            )
            .await?;
        let Some(order) = cancelled else {
            let current = self.order(order_id).await?;
            return Err(ControllerError::invalid_transition(order_id, current.status, "cancel"));
        };
        info!(order_id, "Order cancelled");
        Ok(order)
    }

    /// Runs the dispatched stage, then decides what happens next.
    pub async fn execute(&self, message: &DispatchMessage) -> Result<StageOutcome, StageError> {
        let stage = message.stage;
        let Some(body) = self.bodies.get(&stage) else {
            let err = StageError::Precondition {
                stage,
                message: ControllerError::UnregisteredStage(stage).to_string(),
            };
            self.channel
                .try_update_status(
                    message.order_id,
                    StatusUpdate::new()
                        .with_status(OrderStatus::Failed)
                        .with_error(err.to_string()),
                )
                .await;
            return Err(err);
        };

        let invocation = StageInvocation::new(message.order_id, stage)
            .with_config(message.config.clone())
            .with_required_inputs(self.manifests.required_inputs(stage));
        let outcome = self
            .runner
            .run_stage(invocation, body.as_ref(), &self.manifests.get_or_empty(stage))
            .await?;

        self.advance(message).await;
        Ok(outcome)
    }

    /// Spawns one worker per stage queue, each running up to
    /// `stages.worker_concurrency` messages at once.
    ///
    /// Each receiver can only be taken once; stages whose receiver is
    /// already gone are skipped.
    pub fn spawn_workers(
        self: &Arc<Self>,
        queue: &InMemoryStageQueue,
        token: &Arc<CancellationToken>,
    ) -> Vec<JoinHandle<()>> {
        StageName::ALL
            .into_iter()
            .filter_map(|stage| {
                let rx = queue.take_receiver(stage)?;
                let worker = Worker::new(self.clone(), stage)
                    .with_max_retries(self.config.stages.max_retries)
                    .with_concurrency(self.config.stages.worker_concurrency);
                Some(worker.spawn(rx, token.clone()))
            })
            .collect()
    }

    /// Chains, completes, or stops after a stage finished.
    ///
    /// Every write here is conditional on the order still sitting in the
    /// finished stage, so a cancel that lands meanwhile is never overwritten.
    async fn advance(&self, message: &DispatchMessage) {
        let order_id = message.order_id;
        let stage = message.stage;
        let current = [OrderStatus::Queued, stage.running_status()];

        let next = stage.next().filter(|_| message.chain_to_next());
        let Some(next) = next else {
            let detail = if message.chain_to_next() {
                "Pipeline complete".to_string()
            } else {
                format!("{stage} re-run complete")
            };
            let update = StatusUpdate::new()
                .with_status(OrderStatus::Completed)
                .with_stage(stage)
                .with_progress(100.0)
                .with_detail(detail);
            match self.channel.update_status_if(order_id, &current, update).await {
                Ok(Some(_)) => info!(order_id, stage = %stage, "Order completed"),
                Ok(None) => info!(order_id, stage = %stage, "Order moved on, not completing"),
                Err(e) => error!(order_id, error = %e, "Could not mark order completed"),
            }
            return;
        };

        match self.dispatch_next(message, next, &current).await {
            Ok(true) => {}
            Ok(false) => info!(order_id, stage = %stage, "Order moved on, not chaining"),
            Err(e) => {
                error!(order_id, stage = %next, error = %e, "Could not dispatch next stage");
                let update = StatusUpdate::new()
                    .with_status(OrderStatus::Failed)
                    .with_error(e.to_string());
                if let Err(e) = self.channel.update_status_if(order_id, &current, update).await {
                    error!(order_id, error = %e, "Could not mark order failed");
                }
            }
        }
    }

    /// Moves the order to `next` and enqueues it; `Ok(false)` if the order
    /// left `current` first.
    async fn dispatch_next(
        &self,
        message: &DispatchMessage,
        next: StageName,
        current: &[OrderStatus],
    ) -> Result<bool, ControllerError> {
        self.ensure_body(next)?;
        let queued = self
            .channel
            .update_status_if(
                message.order_id,
                current,
                StatusUpdate::new()
                    .with_status(OrderStatus::Queued)
                    .with_stage(next)
                    .with_progress(0.0)
                    .with_detail(format!("Queued for {next}")),
            )
            .await?;
        if queued.is_none() {
            return Ok(false);
        }
        self.queue.enqueue(message.follow_up(next)).await?;
        Ok(true)
    }

    async fn record_dispatch(&self, order_id: OrderId, stage: StageName, message: &str) {
        let event = ProgressEvent::new(order_id, stage, "dispatch", LogStatus::Started, 0.0, message);
        self.channel.publish(&event).await;
    }

    fn ensure_body(&self, stage: StageName) -> Result<(), ControllerError> {
        if self.bodies.contains_key(&stage) {
            Ok(())
        } else {
            Err(ControllerError::UnregisteredStage(stage))
        }
    }
}

#[async_trait]
impl StageExecutor for PipelineController {
    async fn execute(&self, message: &DispatchMessage) -> Result<StageOutcome, StageError> {
        PipelineController::execute(self, message).await
    }
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("stages", &self.bodies.keys().collect::<Vec<_>>())
            .field("manifests", &self.manifests)
            .finish_non_exhaustive()
    }
}
