//! End-to-end tests driving orders through the controller, queue, and runner.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::PipelineController;
use crate::cancellation::CancellationToken;
use crate::config::{ChannelConfig, OrchestratorConfig};
use crate::core::{LogStatus, ManifestSet, Order, OrderId, OrderStatus, StageLogEntry, StageManifest, StageName};
use crate::errors::ControllerError;
use crate::fetch::{source, BoundedFetcher, InMemoryCacheStore, RetryConfig, TransportResponse};
use crate::progress::{BroadcastTopicBus, InMemoryLogStore, InMemoryOrderStore, OrderStore, ProgressChannel};
use crate::queue::{DispatchMessage, InMemoryStageQueue, Worker};
use crate::runner::{FnStageBody, StageBody, StageContext};
use crate::testing::{
    offline_fetcher, BlockingBody, CancelBeforeTransition, FailingBody, RecordingBody, ScriptedTransport,
};

const PRE: StageName = StageName::Preprocessing;
const RAG: StageName = StageName::RagEnrichment;
const REPORT: StageName = StageName::ReportGeneration;

fn manifests() -> ManifestSet {
    ManifestSet::new()
        .with_manifest(StageManifest::new(PRE, ["matrix.tsv", "qc.json"]).unwrap())
        .with_manifest(StageManifest::new(RAG, ["enriched.json"]).unwrap())
        .with_manifest(StageManifest::new(REPORT, ["report.md"]).unwrap())
        .with_required_inputs(RAG, ["matrix.tsv"])
        .with_required_inputs(REPORT, ["enriched.json"])
}

fn recording() -> [Arc<RecordingBody>; 3] {
    [
        Arc::new(RecordingBody::new("pre").with_artifacts(["matrix.tsv", "qc.json"]).with_fractions([0.3, 0.6, 0.9])),
        Arc::new(RecordingBody::new("rag").with_artifacts(["enriched.json"]).with_fractions([0.5])),
        Arc::new(RecordingBody::new("report").with_artifacts(["report.md"])),
    ]
}

struct Harness {
    dir: TempDir,
    controller: Arc<PipelineController>,
    queue: Arc<InMemoryStageQueue>,
    orders: Arc<InMemoryOrderStore>,
    logs: Arc<InMemoryLogStore>,
    receivers: Vec<(StageName, mpsc::Receiver<DispatchMessage>)>,
}

impl Harness {
    fn new(bodies: [Arc<dyn StageBody>; 3]) -> Self {
        Self::with_fetcher(bodies, offline_fetcher())
    }

    fn with_fetcher(bodies: [Arc<dyn StageBody>; 3], fetcher: Arc<BoundedFetcher>) -> Self {
        Self::build(bodies, fetcher, |orders| orders as Arc<dyn OrderStore>, |config| config)
    }

    fn build(
        bodies: [Arc<dyn StageBody>; 3],
        fetcher: Arc<BoundedFetcher>,
        wrap_store: impl FnOnce(Arc<InMemoryOrderStore>) -> Arc<dyn OrderStore>,
        tune: impl FnOnce(OrchestratorConfig) -> OrchestratorConfig,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let config = tune(OrchestratorConfig::new().with_output_root(dir.path()));
        let orders = Arc::new(InMemoryOrderStore::new());
        let logs = Arc::new(InMemoryLogStore::new());
        let channel = ProgressChannel::new(
            wrap_store(orders.clone()),
            logs.clone(),
            Arc::new(BroadcastTopicBus::default()),
            ChannelConfig::default(),
        );
        let queue = Arc::new(InMemoryStageQueue::new(16));
        let [pre, rag, report] = bodies;
        let controller = PipelineController::new(config, channel, fetcher, queue.clone())
            .with_body(PRE, pre)
            .with_body(RAG, rag)
            .with_body(REPORT, report)
            .with_manifests(manifests());
        Self {
            dir,
            controller: Arc::new(controller),
            queue,
            orders,
            logs,
            receivers: Vec::new(),
        }
    }

    fn recording(bodies: &[Arc<RecordingBody>; 3]) -> Self {
        Self::new([bodies[0].clone(), bodies[1].clone(), bodies[2].clone()])
    }

    async fn add_order(&self, id: OrderId) {
        self.orders.insert(Order::new(id, format!("ORD-{id}"))).await.unwrap();
    }

    fn order(&self, id: OrderId) -> Order {
        self.orders.snapshot(id).unwrap()
    }

    fn artifact(&self, id: OrderId, name: &str) -> PathBuf {
        self.dir.path().join(format!("ORD-{id}")).join(name)
    }

    fn read(&self, id: OrderId, name: &str) -> Vec<u8> {
        std::fs::read(self.artifact(id, name)).unwrap()
    }

    fn log(&self, id: OrderId) -> Vec<StageLogEntry> {
        self.logs.for_order(id)
    }

    /// Delivers queued messages, including follow-ups, until every queue is empty.
    async fn drain(&mut self) {
        if self.receivers.is_empty() {
            for stage in StageName::ALL {
                let rx = self.queue.take_receiver(stage).unwrap();
                self.receivers.push((stage, rx));
            }
        }
        loop {
            let mut delivered = false;
            for (stage, rx) in &mut self.receivers {
                while let Ok(message) = rx.try_recv() {
                    let worker = Worker::new(self.controller.clone(), *stage);
                    let _ = worker.deliver(message).await;
                    delivered = true;
                }
            }
            if !delivered {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_full_pipeline_completes() {
    let bodies = recording();
    let mut h = Harness::recording(&bodies);
    h.add_order(1).await;

    let message = h.controller.start_order(1, json!({"organism": "human"})).await.unwrap();
    assert_eq!(message.stage, PRE);
    assert_eq!(h.order(1).status, OrderStatus::Queued);
    h.drain().await;

    let order = h.order(1);
    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.progress_pct, 100.0);
    assert!(order.completed_at.is_some());
    assert_eq!(h.queue.dispatched_stages(1), vec![PRE, RAG, REPORT]);
    assert!(bodies.iter().all(|b| b.invocations() == 1));
    assert!(h.artifact(1, "report.md").exists());
    assert!(h.queue.dispatched().iter().all(|m| m.config["organism"] == "human"));
}

#[tokio::test]
async fn test_progress_never_decreases_within_a_stage() {
    let bodies = recording();
    let mut h = Harness::recording(&bodies);
    h.add_order(1).await;

    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;

    for stage in StageName::ALL {
        let pcts: Vec<f64> = h
            .log(1)
            .iter()
            .filter(|e| e.stage == stage)
            .filter_map(|e| e.progress_pct)
            .collect();
        assert!(!pcts.is_empty());
        assert!(pcts.windows(2).all(|w| w[0] <= w[1]), "{stage}: {pcts:?}");
    }
}

#[tokio::test]
async fn test_rerun_leaves_other_stages_untouched() {
    let bodies = recording();
    let mut h = Harness::recording(&bodies);
    h.add_order(1).await;
    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;

    let matrix = h.read(1, "matrix.tsv");
    let qc = h.read(1, "qc.json");
    let report = h.read(1, "report.md");
    let enriched = h.read(1, "enriched.json");

    let message = h.controller.rerun_stage(1, RAG, json!({})).await.unwrap();
    assert!(!message.chain_to_next());
    assert!(!h.artifact(1, "enriched.json").exists());
    h.drain().await;

    assert_eq!(h.read(1, "matrix.tsv"), matrix);
    assert_eq!(h.read(1, "qc.json"), qc);
    assert_eq!(h.read(1, "report.md"), report);
    assert_ne!(h.read(1, "enriched.json"), enriched);
    assert_eq!(bodies[1].invocations(), 2);
    assert_eq!(bodies[2].invocations(), 1);
    assert_eq!(h.queue.dispatched_stages(1), vec![PRE, RAG, REPORT, RAG]);
    assert_eq!(h.order(1).status, OrderStatus::Completed);
}

#[tokio::test]
async fn test_rerun_without_upstream_is_rejected() {
    let bodies = recording();
    let mut h = Harness::recording(&bodies);
    h.add_order(1).await;
    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;
    std::fs::remove_file(h.artifact(1, "enriched.json")).unwrap();

    let err = h.controller.rerun_stage(1, REPORT, json!({})).await.unwrap_err();

    assert!(matches!(err, ControllerError::MissingUpstream { stage: REPORT, .. }));
    let order = h.order(1);
    assert_eq!(order.status, OrderStatus::Failed);
    assert!(order.error_message.unwrap().contains("enriched.json"));
    assert!(h.artifact(1, "report.md").exists());
    assert_eq!(h.queue.dispatched_stages(1).len(), 3);
}

#[tokio::test]
async fn test_cached_stage_skips_body() {
    let bodies = recording();
    let mut h = Harness::recording(&bodies);
    h.add_order(1).await;
    let dir = h.artifact(1, "");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("matrix.tsv"), b"precomputed").unwrap();
    std::fs::write(dir.join("qc.json"), b"{}").unwrap();

    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;

    assert_eq!(bodies[0].invocations(), 0);
    assert_eq!(h.read(1, "matrix.tsv"), b"precomputed".to_vec());
    let cached: Vec<_> = h
        .log(1)
        .into_iter()
        .filter(|e| e.stage == PRE && e.status == LogStatus::Completed)
        .collect();
    assert_eq!(cached.len(), 1);
    assert!(cached[0].message.contains("(cached)"));
    assert_eq!(h.order(1).status, OrderStatus::Completed);
}

#[tokio::test]
async fn test_failed_stage_rerun_reexecutes_and_keeps_upstream() {
    let pre = Arc::new(RecordingBody::new("pre").with_artifacts(["matrix.tsv", "qc.json"]));
    let rag = Arc::new(FailingBody::new("rag", "enrichment service exploded").recovering_after(2, ["enriched.json"]));
    let report = Arc::new(RecordingBody::new("report").with_artifacts(["report.md"]));
    let mut h = Harness::new([pre.clone(), rag.clone(), report.clone()]);
    h.add_order(1).await;

    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;

    let order = h.order(1);
    assert_eq!(order.status, OrderStatus::Failed);
    assert!(order.error_message.unwrap().contains("enrichment service exploded"));
    assert_eq!(rag.invocations(), 2);
    assert_eq!(h.queue.dispatched_stages(1), vec![PRE, RAG]);
    assert!(!h.artifact(1, "enriched.json").exists());
    let matrix = h.read(1, "matrix.tsv");

    h.controller.rerun_stage(1, RAG, json!({})).await.unwrap();
    h.drain().await;

    assert_eq!(rag.invocations(), 3);
    assert!(h.artifact(1, "enriched.json").exists());
    assert_eq!(h.read(1, "matrix.tsv"), matrix);
    assert_eq!(pre.invocations(), 1);
    assert_eq!(report.invocations(), 0);
    assert_eq!(h.order(1).status, OrderStatus::Completed);
    assert!(h.order(1).error_message.is_none());
}

#[tokio::test]
async fn test_restart_from_failed_skips_completed_stages() {
    let pre = Arc::new(RecordingBody::new("pre").with_artifacts(["matrix.tsv", "qc.json"]));
    let rag = Arc::new(FailingBody::new("rag", "timeout").recovering_after(2, ["enriched.json"]));
    let report = Arc::new(RecordingBody::new("report").with_artifacts(["report.md"]));
    let mut h = Harness::new([pre.clone(), rag.clone(), report.clone()]);
    h.add_order(1).await;
    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;
    assert_eq!(h.order(1).status, OrderStatus::Failed);

    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;

    assert_eq!(pre.invocations(), 1);
    assert_eq!(rag.invocations(), 3);
    assert_eq!(report.invocations(), 1);
    assert_eq!(h.order(1).status, OrderStatus::Completed);
    let dispatches = h.log(1).into_iter().filter(|e| e.step == "dispatch").count();
    assert_eq!(dispatches, 2);
}

#[tokio::test]
async fn test_restart_from_completed_is_a_fresh_run() {
    let bodies = recording();
    let mut h = Harness::recording(&bodies);
    h.add_order(1).await;
    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;

    h.controller.start_order(1, json!({})).await.unwrap();
    assert!(!h.artifact(1, "matrix.tsv").exists());
    assert!(!h.artifact(1, "report.md").exists());
    h.drain().await;

    assert!(bodies.iter().all(|b| b.invocations() == 2));
    assert_eq!(h.order(1).status, OrderStatus::Completed);
}

#[tokio::test]
async fn test_worker_redelivers_failed_stage_once() {
    let pre = Arc::new(FailingBody::new("pre", "flaky disk").recovering_after(1, ["matrix.tsv", "qc.json"]));
    let mut h = Harness::new([
        pre.clone(),
        Arc::new(RecordingBody::new("rag").with_artifacts(["enriched.json"])),
        Arc::new(RecordingBody::new("report").with_artifacts(["report.md"])),
    ]);
    h.add_order(1).await;

    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;

    assert_eq!(pre.invocations(), 2);
    let failures = h.log(1).into_iter().filter(|e| e.status == LogStatus::Failed).count();
    assert_eq!(failures, 1);
    let order = h.order(1);
    assert_eq!(order.status, OrderStatus::Completed);
    assert!(order.error_message.is_none());
}

#[tokio::test]
async fn test_invalid_transitions() {
    let bodies = recording();
    let mut h = Harness::recording(&bodies);
    h.add_order(1).await;

    assert!(matches!(
        h.controller.cancel_order(1).await.unwrap_err(),
        ControllerError::InvalidTransition { .. }
    ));
    assert!(matches!(
        h.controller.rerun_stage(1, RAG, json!({})).await.unwrap_err(),
        ControllerError::InvalidTransition { .. }
    ));
    assert!(matches!(
        h.controller.start_order(99, json!({})).await.unwrap_err(),
        ControllerError::OrderNotFound(99)
    ));

    h.controller.start_order(1, json!({})).await.unwrap();
    let err = h.controller.start_order(1, json!({})).await.unwrap_err();
    assert_eq!(err.to_dict()["type"], "InvalidTransition");

    h.drain().await;
    assert!(h.controller.cancel_order(1).await.is_err());
}

#[tokio::test]
async fn test_cancel_queued_order_never_runs() {
    let bodies = recording();
    let mut h = Harness::recording(&bodies);
    h.add_order(1).await;

    h.controller.start_order(1, json!({})).await.unwrap();
    let order = h.controller.cancel_order(1).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    h.drain().await;

    assert_eq!(bodies[0].invocations(), 0);
    assert_eq!(h.queue.dispatched_stages(1), vec![PRE]);
    assert_eq!(h.log(1).last().unwrap().status, LogStatus::Skipped);
    assert_eq!(h.order(1).status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_mid_stage_with_workers() {
    let blocking = Arc::new(BlockingBody::new("pre", Duration::from_millis(5), 2000));
    let h = Harness::new([
        blocking.clone(),
        Arc::new(RecordingBody::new("rag").with_artifacts(["enriched.json"])),
        Arc::new(RecordingBody::new("report").with_artifacts(["report.md"])),
    ]);
    h.add_order(1).await;
    let token = Arc::new(CancellationToken::new());
    let handles = h.controller.spawn_workers(&h.queue, &token);
    assert_eq!(handles.len(), 3);

    h.controller.start_order(1, json!({})).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), blocking.wait_started())
        .await
        .unwrap();
    h.controller.cancel_order(1).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !h.log(1).iter().any(|e| e.status == LogStatus::Skipped) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let order = h.order(1);
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(order.error_message.is_none());
    assert_eq!(h.queue.dispatched_stages(1), vec![PRE]);
    assert!(!h.log(1).iter().any(|e| e.status == LogStatus::Failed));

    token.cancel("test finished");
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_orders_share_fetch_cache() {
    let transport = Arc::new(ScriptedTransport::new().with_default(TransportResponse::ok(r#"{"go": ["kinase"]}"#)));
    let fetcher = Arc::new(BoundedFetcher::new(
        crate::config::FetchConfig::new().with_retry(RetryConfig::immediate()),
        transport.clone(),
        Arc::new(InMemoryCacheStore::new()),
    ));
    let rag = Arc::new(FnStageBody::new("rag", |ctx: StageContext| async move {
        let keys = vec!["P31749".to_string(), "sp|P04637|P53_HUMAN".to_string(), "Q9Y243-1".to_string()];
        let results = ctx.fetcher().fetch_batch(&source::uniprot(), &keys, 2, None).await;
        ctx.report(0.8, "fetch", "fetched annotations").await;
        tokio::fs::write(ctx.artifact_path("enriched.json"), serde_json::to_vec(&results)?).await?;
        Ok::<(), anyhow::Error>(())
    }));
    let mut h = Harness::with_fetcher(
        [
            Arc::new(RecordingBody::new("pre").with_artifacts(["matrix.tsv", "qc.json"])),
            rag,
            Arc::new(RecordingBody::new("report").with_artifacts(["report.md"])),
        ],
        fetcher.clone(),
    );
    h.add_order(1).await;
    h.add_order(2).await;

    h.controller.start_order(1, json!({})).await.unwrap();
    h.controller.start_order(2, json!({})).await.unwrap();
    h.drain().await;

    assert_eq!(transport.call_count(), 3);
    assert_eq!(fetcher.stats().cache_hits, 3);
    assert_eq!(h.order(1).status, OrderStatus::Completed);
    assert_eq!(h.order(2).status, OrderStatus::Completed);
    let enriched: serde_json::Value = serde_json::from_slice(&h.read(2, "enriched.json")).unwrap();
    assert_eq!(enriched["P31749"]["go"], json!(["kinase"]));
}

#[tokio::test]
async fn test_cancel_between_stages_is_not_overwritten() {
    let bodies = recording();
    let racing = Arc::new(std::sync::OnceLock::new());
    let slot = racing.clone();
    let mut h = Harness::build(
        [bodies[0].clone(), bodies[1].clone(), bodies[2].clone()],
        offline_fetcher(),
        move |orders| {
            let store = Arc::new(CancelBeforeTransition::new(orders, OrderStatus::Queued).for_stage(RAG));
            let _ = slot.set(store.clone());
            store as Arc<dyn OrderStore>
        },
        |config| config,
    );
    h.add_order(1).await;

    h.controller.start_order(1, json!({})).await.unwrap();
    h.drain().await;

    let racing: &Arc<CancelBeforeTransition> = racing.get().unwrap();
    assert!(racing.fired());
    assert_eq!(h.order(1).status, OrderStatus::Cancelled);
    assert_eq!(h.queue.dispatched_stages(1), vec![PRE]);
    assert_eq!(bodies[0].invocations(), 1);
    assert_eq!(bodies[1].invocations(), 0);
}

#[tokio::test]
async fn test_orders_in_same_stage_run_concurrently() {
    let gate = Arc::new(tokio::sync::Barrier::new(2));
    let pre = {
        let gate = gate.clone();
        Arc::new(FnStageBody::new("pre", move |ctx: StageContext| {
            let gate = gate.clone();
            async move {
                // Passes only when both orders are inside stage 1 together.
                tokio::time::timeout(Duration::from_secs(2), gate.wait()).await?;
                tokio::fs::write(ctx.artifact_path("matrix.tsv"), b"1").await?;
                tokio::fs::write(ctx.artifact_path("qc.json"), b"{}").await?;
                Ok::<(), anyhow::Error>(())
            }
        }))
    };
    let h = Harness::build(
        [
            pre,
            Arc::new(RecordingBody::new("rag").with_artifacts(["enriched.json"])),
            Arc::new(RecordingBody::new("report").with_artifacts(["report.md"])),
        ],
        offline_fetcher(),
        |orders| orders as Arc<dyn OrderStore>,
        |config| config.with_worker_concurrency(2),
    );
    h.add_order(1).await;
    h.add_order(2).await;
    let token = Arc::new(CancellationToken::new());
    let handles = h.controller.spawn_workers(&h.queue, &token);

    h.controller.start_order(1, json!({})).await.unwrap();
    h.controller.start_order(2, json!({})).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.order(1).status != OrderStatus::Completed || h.order(2).status != OrderStatus::Completed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!h.log(1).iter().any(|e| e.status == LogStatus::Failed));
    assert!(!h.log(2).iter().any(|e| e.status == LogStatus::Failed));

    token.cancel("test finished");
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
