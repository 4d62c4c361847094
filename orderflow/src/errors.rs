//! Error types for the orderflow orchestration core.
//!
//! The taxonomy mirrors how failures are allowed to travel:
//! - [`FetchError`] never leaves the fetcher; it only drives retry decisions.
//! - [`SinkError`] never leaves the progress channel; it is logged and dropped.
//! - [`StageError`] is raised by the stage runner after the failure is persisted.
//! - [`ControllerError`] rejects invalid lifecycle requests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::core::{OrderId, OrderStatus, StageName};

/// The main error type for orderflow operations.
#[derive(Debug, Error)]
pub enum OrderflowError {
    /// A stage run failed.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// A controller request was rejected.
    #[error("{0}")]
    Controller(#[from] ControllerError),

    /// A progress sink failed.
    #[error("{0}")]
    Sink(#[from] SinkError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while talking to an external source.
///
/// Every variant is classified as retryable or not; none of them is ever
/// returned from a batch call.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The request did not complete within its per-call timeout.
    #[error("Request to {source_name} timed out after {timeout:?}")]
    Timeout {
        /// The source name.
        source_name: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The source answered with HTTP 429.
    #[error("Rate limited by {source_name}")]
    RateLimited {
        /// The source name.
        source_name: String,
    },

    /// The source answered with a non-success status.
    #[error("{source_name} returned status {status}")]
    Status {
        /// The source name.
        source_name: String,
        /// HTTP status code.
        status: u16,
    },

    /// The source reported the key as unknown.
    #[error("{source_name} has no entry for '{key}'")]
    NotFound {
        /// The source name.
        source_name: String,
        /// The normalized key.
        key: String,
    },

    /// The transport failed before a response arrived.
    #[error("Transport error from {source_name}: {message}")]
    Transport {
        /// The source name.
        source_name: String,
        /// Error detail.
        message: String,
    },

    /// The response body could not be parsed into the source's shape.
    #[error("Could not parse {source_name} response: {message}")]
    Parse {
        /// The source name.
        source_name: String,
        /// Error detail.
        message: String,
    },
}

impl FetchError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::NotFound { .. } | Self::Parse { .. } => false,
        }
    }

    /// Whether this is a rate-limit response.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// A failure in the shared fetch cache.
///
/// Cache failures degrade to a miss (on read) or a skipped write.
#[derive(Debug, Clone, Error)]
#[error("Cache error for '{key}': {message}")]
pub struct CacheError {
    /// The cache key.
    pub key: String,
    /// Error detail.
    pub message: String,
}

impl CacheError {
    /// Creates a new cache error.
    #[must_use]
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// The three sinks of the progress channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Denormalized order status record.
    Status,
    /// Append-only stage log.
    Log,
    /// Live order topic.
    Topic,
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Log => write!(f, "log"),
            Self::Topic => write!(f, "topic"),
        }
    }
}

/// A failure in one progress sink.
#[derive(Debug, Clone, Error)]
#[error("{sink} sink failed for order {order_id}: {message}")]
pub struct SinkError {
    /// Which sink failed.
    pub sink: SinkKind,
    /// The order being written.
    pub order_id: OrderId,
    /// Error detail.
    pub message: String,
}

impl SinkError {
    /// Creates a new sink error.
    #[must_use]
    pub fn new(sink: SinkKind, order_id: OrderId, message: impl Into<String>) -> Self {
        Self {
            sink,
            order_id,
            message: message.into(),
        }
    }

    /// Error for an order that the sink does not know.
    #[must_use]
    pub fn unknown_order(sink: SinkKind, order_id: OrderId) -> Self {
        Self::new(sink, order_id, "order not found")
    }
}

/// Errors raised by a stage run.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage body returned an error.
    #[error("{stage} failed: {source}")]
    Body {
        /// The failing stage.
        stage: StageName,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The order was cancelled while the stage ran.
    #[error("{stage} cancelled for order {order_id}")]
    Cancelled {
        /// The order.
        order_id: OrderId,
        /// The stage that observed the cancellation.
        stage: StageName,
    },

    /// A required input was missing before the body started.
    #[error("{stage} precondition failed: {message}")]
    Precondition {
        /// The stage.
        stage: StageName,
        /// What was missing.
        message: String,
    },

    /// An artifact operation failed.
    #[error("Artifact error for {stage}: {source}")]
    Artifact {
        /// The stage.
        stage: StageName,
        /// The IO failure.
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    /// Returns true if this is a cooperative cancellation, not a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The stage this error belongs to.
    #[must_use]
    pub fn stage(&self) -> StageName {
        match self {
            Self::Body { stage, .. }
            | Self::Cancelled { stage, .. }
            | Self::Precondition { stage, .. }
            | Self::Artifact { stage, .. } => *stage,
        }
    }

    /// Renders the full error chain for failure metadata.
    #[must_use]
    pub fn trace(&self) -> String {
        match self {
            Self::Body { source, .. } => format!("{source:?}"),
            other => format!("{other:?}"),
        }
    }
}

/// Errors raised by the pipeline controller.
#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    /// The order does not exist.
    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    /// The requested transition is not allowed from the current status.
    #[error("Cannot {action} order {order_id} in status '{status}'")]
    InvalidTransition {
        /// The order.
        order_id: OrderId,
        /// The current status.
        status: OrderStatus,
        /// The rejected action.
        action: String,
    },

    /// An upstream artifact needed by the stage is missing.
    #[error("{stage} requires upstream artifact '{artifact}'")]
    MissingUpstream {
        /// The stage being dispatched.
        stage: StageName,
        /// The missing artifact.
        artifact: String,
    },

    /// No body is registered for the stage.
    #[error("No stage body registered for {0}")]
    UnregisteredStage(StageName),

    /// The dispatch queue refused the message.
    #[error("Queue '{queue}' rejected dispatch: {message}")]
    Dispatch {
        /// The queue name.
        queue: String,
        /// Error detail.
        message: String,
    },

    /// Artifact invalidation failed.
    #[error("Could not invalidate artifacts for {stage}: {message}")]
    Invalidation {
        /// The stage.
        stage: StageName,
        /// Error detail.
        message: String,
    },

    /// The order store could not be read or written.
    #[error("{0}")]
    Store(#[from] SinkError),
}

impl ControllerError {
    /// Creates an invalid transition error.
    #[must_use]
    pub fn invalid_transition(
        order_id: OrderId,
        status: OrderStatus,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            order_id,
            status,
            action: action.into(),
        }
    }

    /// Converts to a dictionary representation for API responses.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        let kind = match self {
            Self::OrderNotFound(_) => "OrderNotFound",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::MissingUpstream { .. } => "MissingUpstream",
            Self::UnregisteredStage(_) => "UnregisteredStage",
            Self::Dispatch { .. } => "DispatchFailed",
            Self::Invalidation { .. } => "InvalidationFailed",
            Self::Store(_) => "StoreUnavailable",
        };
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Truncates `text` to at most `max_chars` characters on a char boundary.
#[must_use]
pub fn truncate_message(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_retry_classification() {
        let timeout = FetchError::Timeout {
            source_name: "kegg".into(),
            timeout: Duration::from_secs(1),
        };
        let server = FetchError::Status {
            source_name: "kegg".into(),
            status: 503,
        };
        let client = FetchError::Status {
            source_name: "kegg".into(),
            status: 400,
        };
        let missing = FetchError::NotFound {
            source_name: "kegg".into(),
            key: "Akt1".into(),
        };

        assert!(timeout.is_retryable());
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!missing.is_retryable());
        assert!(FetchError::RateLimited { source_name: "x".into() }.is_rate_limited());
    }

    #[test]
    fn test_sink_error_display() {
        let err = SinkError::new(SinkKind::Log, 7, "disk full");
        assert_eq!(err.to_string(), "log sink failed for order 7: disk full");
    }

    #[test]
    fn test_stage_error_trace_keeps_chain() {
        let source = anyhow::anyhow!("column missing").context("loading matrix");
        let err = StageError::Body {
            stage: StageName::Preprocessing,
            source,
        };

        assert!(err.trace().contains("column missing"));
        assert!(err.trace().contains("loading matrix"));
        assert_eq!(err.stage(), StageName::Preprocessing);
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_controller_error_to_dict() {
        let err = ControllerError::invalid_transition(3, OrderStatus::Stage2, "re-run");
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "InvalidTransition");
        assert!(err.to_string().contains("stage2"));
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("abcdef", 3), "abc");
        assert_eq!(truncate_message("ab", 3), "ab");
        assert_eq!(truncate_message("αβγδ", 2), "αβ");
    }
}
