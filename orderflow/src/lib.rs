//! # Orderflow
//!
//! Durable orchestration for three-stage analysis orders.
//!
//! An order moves through preprocessing, enrichment, and report generation.
//! Each stage is dispatched on its own queue and wrapped by a runner that
//! provides:
//!
//! - **Idempotent stages**: a stage whose artifact manifest is already
//!   satisfied is skipped and reported as cached
//! - **Progress fan-out**: every event goes to the order status record, an
//!   append-only stage log, and a live per-order topic
//! - **Bounded external fetching**: per-source concurrency caps, retry with
//!   backoff, caching, and default shapes instead of errors
//! - **Scoped re-runs**: one stage can be re-run without touching the
//!   artifacts of any other stage
//! - **Live streaming**: clients tail an order's topic with coalescing and
//!   keepalive pings
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use orderflow::prelude::*;
//!
//! let (channel, orders, _logs) = orderflow::testing::test_channel();
//! let queue = Arc::new(InMemoryStageQueue::default());
//! let controller = Arc::new(
//!     PipelineController::new(config, channel, fetcher, queue.clone())
//!         .with_body(StageName::Preprocessing, preprocess)
//!         .with_body(StageName::RagEnrichment, enrich)
//!         .with_body(StageName::ReportGeneration, report)
//!         .with_manifests(manifests),
//! );
//! let workers = controller.spawn_workers(&queue, &token);
//! controller.start_order(order_id, serde_json::json!({})).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod controller;
pub mod core;
pub mod errors;
pub mod fetch;
pub mod gateway;
pub mod observability;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        ChannelConfig, FetchConfig, GatewayConfig, OrchestratorConfig, ProgressWindow, StagesConfig,
    };
    pub use crate::controller::PipelineController;
    pub use crate::core::{
        LogStatus, ManifestSet, Order, OrderId, OrderStatus, ProgressEvent, StageLogEntry,
        StageManifest, StageName, StatusUpdate,
    };
    pub use crate::errors::{
        ControllerError, FetchError, OrderflowError, SinkError, StageError,
    };
    pub use crate::fetch::{
        BoundedFetcher, CacheStore, InMemoryCacheStore, RetryConfig, SourceDescriptor, Transport,
    };
    pub use crate::gateway::{GatewayFrame, StreamingGateway};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::progress::{
        BroadcastTopicBus, InMemoryLogStore, InMemoryOrderStore, LogStore, OrderStore,
        ProgressChannel, TopicBus,
    };
    pub use crate::queue::{DispatchMessage, InMemoryStageQueue, StageQueue, Worker};
    pub use crate::runner::{FnStageBody, StageBody, StageContext, StageRunner};
}
