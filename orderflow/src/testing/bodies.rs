//! Stage bodies with scripted behavior.

use anyhow::bail;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::{OrderStatus, StatusUpdate};
use crate::progress::OrderStore;
use crate::runner::{StageBody, StageContext};

async fn write_artifacts(ctx: &StageContext, artifacts: &[String], tag: &str) -> anyhow::Result<()> {
    for name in artifacts {
        tokio::fs::write(ctx.artifact_path(name), format!("{tag}:{name}\n")).await?;
    }
    Ok(())
}

/// Counts invocations, reports fixed fractions, and writes its artifacts.
///
/// Artifact contents include the invocation number, so a re-run is
/// visible byte for byte.
#[derive(Debug)]
pub struct RecordingBody {
    name: String,
    artifacts: Vec<String>,
    fractions: Vec<f64>,
    invocations: AtomicUsize,
}

impl RecordingBody {
    /// Creates a body with no artifacts and no progress reports.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifacts: Vec::new(),
            fractions: Vec::new(),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Artifacts written on every successful run.
    #[must_use]
    pub fn with_artifacts<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    /// Fractions reported, in order, before the artifacts are written.
    #[must_use]
    pub fn with_fractions(mut self, fractions: impl IntoIterator<Item = f64>) -> Self {
        self.fractions = fractions.into_iter().collect();
        self
    }

    /// Number of times the body ran.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageBody for RecordingBody {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<()> {
        let run = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        for (i, fraction) in self.fractions.iter().enumerate() {
            ctx.report(*fraction, "work", &format!("step {}", i + 1)).await;
            ctx.checkpoint().await?;
        }
        write_artifacts(ctx, &self.artifacts, &format!("{} run {run}", self.name)).await
    }
}

/// Fails after reporting some progress, optionally succeeding later.
#[derive(Debug)]
pub struct FailingBody {
    name: String,
    message: String,
    failures: usize,
    artifacts: Vec<String>,
    invocations: AtomicUsize,
}

impl FailingBody {
    /// A body that always fails with `message`.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            failures: usize::MAX,
            artifacts: Vec::new(),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Fails only the first `failures` runs, then writes `artifacts`.
    #[must_use]
    pub fn recovering_after<I, S>(mut self, failures: usize, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failures = failures;
        self.artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    /// Number of times the body ran.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageBody for FailingBody {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<()> {
        let run = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.report(0.5, "work", "halfway").await;
        if run <= self.failures {
            bail!("{}", self.message);
        }
        write_artifacts(ctx, &self.artifacts, &format!("{} run {run}", self.name)).await
    }
}

/// Cancels its own order mid-run, then hits a checkpoint.
pub struct CancellingBody {
    name: String,
    orders: Arc<dyn OrderStore>,
}

impl CancellingBody {
    /// Creates the body; `orders` is where the cancel is written.
    #[must_use]
    pub fn new(name: impl Into<String>, orders: Arc<dyn OrderStore>) -> Self {
        Self {
            name: name.into(),
            orders,
        }
    }
}

impl std::fmt::Debug for CancellingBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellingBody").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl StageBody for CancellingBody {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<()> {
        ctx.report(0.3, "work", "before cancel").await;
        self.orders
            .update(ctx.order_id(), &StatusUpdate::new().with_status(OrderStatus::Cancelled))
            .await?;
        ctx.checkpoint().await?;
        bail!("checkpoint did not observe cancellation")
    }
}

/// Checkpoints in a loop until the order is cancelled or the limit is hit.
#[derive(Debug)]
pub struct BlockingBody {
    name: String,
    tick: Duration,
    max_ticks: usize,
    started: Notify,
}

impl BlockingBody {
    /// Creates a body checking every `tick`, giving up after `max_ticks`.
    #[must_use]
    pub fn new(name: impl Into<String>, tick: Duration, max_ticks: usize) -> Self {
        Self {
            name: name.into(),
            tick,
            max_ticks,
            started: Notify::new(),
        }
    }

    /// Completes once the body has started running.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl StageBody for BlockingBody {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<()> {
        self.started.notify_one();
        for tick in 0..self.max_ticks {
            ctx.checkpoint().await?;
            #[allow(clippy::cast_precision_loss)]
            let fraction = tick as f64 / self.max_ticks as f64;
            ctx.report(fraction, "wait", "waiting").await;
            tokio::time::sleep(self.tick).await;
        }
        bail!("never cancelled")
    }
}
