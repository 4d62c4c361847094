//! Tracing subscriber initialization.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::{OrderId, StageName};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs.
    Json,
    /// Human-readable logs.
    #[default]
    Plain,
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` controls levels and defaults to `info`. Library code never
/// calls this; binaries and tests opt in. Repeated calls are no-ops.
pub fn init_tracing(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);

        // A subscriber installed elsewhere wins.
        let _ = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
        };
    });
}

/// A span carrying the order and stage of the work inside it.
#[must_use]
pub fn order_span(order_id: OrderId, stage: StageName) -> Span {
    tracing::info_span!("stage", order_id, stage = stage.as_str())
}
