//! Configuration for the orchestration core.
//!
//! A single [`OrchestratorConfig`] is constructed explicitly and handed to
//! every component; nothing reads process-wide settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::StageName;
use crate::errors::OrderflowError;
use crate::fetch::RetryConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory holding one sub-directory per order code.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// External fetch settings.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Per-stage settings.
    #[serde(default)]
    pub stages: StagesConfig,
    /// Progress channel settings.
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Streaming gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("data/outputs")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            fetch: FetchConfig::default(),
            stages: StagesConfig::default(),
            channel: ChannelConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, OrderflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, OrderflowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrderflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&content)
    }

    /// Sets the output root.
    #[must_use]
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    /// Sets the fetch configuration.
    #[must_use]
    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    /// Sets the gateway configuration.
    #[must_use]
    pub fn with_gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    /// Sets the window of one stage.
    #[must_use]
    pub fn with_stage_window(mut self, stage: StageName, window: ProgressWindow) -> Self {
        self.stages.windows.insert(stage, window);
        self
    }

    /// Sets how many messages each stage worker runs at once.
    #[must_use]
    pub fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.stages.worker_concurrency = concurrency.max(1);
        self
    }

    /// The output directory of an order.
    #[must_use]
    pub fn order_dir(&self, order_code: &str) -> PathBuf {
        self.output_root.join(order_code)
    }
}

/// Settings for the bounded external fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Base URL that source endpoints are resolved against.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Worker pool size for batch fetches.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Keys per sub-batch; clamped to `10..=20`.
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,
    /// Per-call timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
    /// Minimum seconds between batch progress callbacks.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_seconds: f64,
    /// Default in-flight cap per source.
    #[serde(default = "default_per_source_concurrency")]
    pub per_source_concurrency: usize,
    /// Lifetime of refreshable cache entries in seconds.
    #[serde(default = "default_refreshable_ttl")]
    pub refreshable_ttl_seconds: u64,
    /// Retry behaviour for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_base_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_sub_batch_size() -> usize {
    20
}

fn default_request_timeout() -> f64 {
    15.0
}

fn default_progress_interval() -> f64 {
    2.0
}

fn default_per_source_concurrency() -> usize {
    5
}

fn default_refreshable_ttl() -> u64 {
    7 * 86_400
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            max_workers: default_max_workers(),
            sub_batch_size: default_sub_batch_size(),
            request_timeout_seconds: default_request_timeout(),
            progress_interval_seconds: default_progress_interval(),
            per_source_concurrency: default_per_source_concurrency(),
            refreshable_ttl_seconds: default_refreshable_ttl(),
            retry: RetryConfig::default(),
        }
    }
}

impl FetchConfig {
    /// Creates a fetch configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Sets the sub-batch size.
    #[must_use]
    pub fn with_sub_batch_size(mut self, size: usize) -> Self {
        self.sub_batch_size = size;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.request_timeout_seconds = seconds;
        self
    }

    /// Sets the progress interval.
    #[must_use]
    pub fn with_progress_interval(mut self, seconds: f64) -> Self {
        self.progress_interval_seconds = seconds;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Per-call timeout as a Duration.
    ///
    /// Values that do not fit a Duration fall back to the default.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        seconds_or(self.request_timeout_seconds.max(0.001), default_request_timeout())
    }

    /// Progress interval as a Duration.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        seconds_or(self.progress_interval_seconds.max(0.0), default_progress_interval())
    }

    /// Sub-batch size clamped to the supported range.
    #[must_use]
    pub fn effective_sub_batch_size(&self) -> usize {
        self.sub_batch_size.clamp(10, 20)
    }

    /// Refreshable entry lifetime as a Duration.
    #[must_use]
    pub fn refreshable_ttl(&self) -> Duration {
        Duration::from_secs(self.refreshable_ttl_seconds)
    }
}

fn seconds_or(seconds: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

/// Mapping of a stage body's `[0, 1]` fraction onto absolute percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressWindow {
    /// Percentage at fraction 0.
    pub base: f64,
    /// Width of the window.
    pub span: f64,
    /// Percentage reported on completion.
    #[serde(default = "default_terminal")]
    pub terminal: f64,
}

fn default_terminal() -> f64 {
    100.0
}

impl Default for ProgressWindow {
    fn default() -> Self {
        Self {
            base: 0.0,
            span: 95.0,
            terminal: default_terminal(),
        }
    }
}

impl ProgressWindow {
    /// Creates a window.
    #[must_use]
    pub fn new(base: f64, span: f64) -> Self {
        Self {
            base,
            span,
            terminal: default_terminal(),
        }
    }

    /// Maps a fraction to an absolute percentage, clamped to `[0, 100]`.
    ///
    /// Fractions outside `[0, 1]` (and NaN) are clamped first.
    #[must_use]
    pub fn map(&self, fraction: f64) -> f64 {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        let pct = self.base + fraction * self.span;
        (pct.clamp(0.0, 100.0) * 10.0).round() / 10.0
    }
}

/// Per-stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Progress windows keyed by stage.
    #[serde(default)]
    pub windows: HashMap<StageName, ProgressWindow>,
    /// Times a failed stage is re-delivered by the queue.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Messages each stage worker runs at once; different orders in the
    /// same stage overlap up to this limit.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

fn default_max_retries() -> u32 {
    1
}

fn default_worker_concurrency() -> usize {
    4
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            windows: HashMap::new(),
            max_retries: default_max_retries(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

impl StagesConfig {
    /// The window for a stage.
    #[must_use]
    pub fn window(&self, stage: StageName) -> ProgressWindow {
        self.windows.get(&stage).copied().unwrap_or_default()
    }
}

/// Progress channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Topic name prefix; the order id is appended.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Buffered messages per topic before slow subscribers lag.
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,
    /// Maximum log message length.
    #[serde(default = "default_message_max_len")]
    pub message_max_len: usize,
    /// Maximum stage detail length.
    #[serde(default = "default_stage_detail_max_len")]
    pub stage_detail_max_len: usize,
    /// Maximum stored error message length.
    #[serde(default = "default_message_max_len")]
    pub error_message_max_len: usize,
}

fn default_topic_prefix() -> String {
    "order:progress:".to_string()
}

fn default_topic_capacity() -> usize {
    256
}

fn default_message_max_len() -> usize {
    2000
}

fn default_stage_detail_max_len() -> usize {
    255
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            topic_capacity: default_topic_capacity(),
            message_max_len: default_message_max_len(),
            stage_detail_max_len: default_stage_detail_max_len(),
            error_message_max_len: default_message_max_len(),
        }
    }
}

/// Streaming gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Sleep between polls in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Maximum messages drained per poll.
    #[serde(default = "default_drain_limit")]
    pub drain_limit: usize,
    /// Wait for each drained message in milliseconds.
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_ms: u64,
    /// Empty polls between keepalive pings.
    #[serde(default = "default_ping_every")]
    pub ping_every_idle_cycles: u32,
}

fn default_poll_interval() -> u64 {
    200
}

fn default_drain_limit() -> usize {
    50
}

fn default_recv_timeout() -> u64 {
    50
}

fn default_ping_every() -> u32 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            drain_limit: default_drain_limit(),
            recv_timeout_ms: default_recv_timeout(),
            ping_every_idle_cycles: default_ping_every(),
        }
    }
}

impl GatewayConfig {
    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the idle cycles between pings.
    #[must_use]
    pub fn with_ping_every(mut self, cycles: u32) -> Self {
        self.ping_every_idle_cycles = cycles;
        self
    }

    /// Poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Receive timeout as a Duration.
    #[must_use]
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Idle interval after which a ping is due.
    #[must_use]
    pub fn ping_after(&self) -> Duration {
        self.poll_interval() * self.ping_every_idle_cycles.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.fetch.max_workers, 4);
        assert_eq!(config.fetch.sub_batch_size, 20);
        assert_eq!(config.fetch.refreshable_ttl(), Duration::from_secs(604_800));
        assert_eq!(config.stages.max_retries, 1);
        assert_eq!(config.stages.worker_concurrency, 4);
        assert_eq!(config.gateway.drain_limit, 50);
        assert_eq!(config.channel.topic_prefix, "order:progress:");
    }

    #[test]
    fn test_from_json_partial() {
        let config = OrchestratorConfig::from_json_str(
            r#"{
                "output_root": "/tmp/out",
                "fetch": {"max_workers": 8, "sub_batch_size": 50},
                "stages": {"windows": {"rag_enrichment": {"base": 10, "span": 80}}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.output_root, PathBuf::from("/tmp/out"));
        assert_eq!(config.fetch.max_workers, 8);
        assert_eq!(config.fetch.effective_sub_batch_size(), 20);
        assert_eq!(config.fetch.request_timeout_seconds, 15.0);

        let window = config.stages.window(StageName::RagEnrichment);
        assert_eq!(window.base, 10.0);
        assert_eq!(window.terminal, 100.0);
        assert_eq!(config.stages.window(StageName::Preprocessing), ProgressWindow::default());
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(OrchestratorConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_progress_window_map() {
        let window = ProgressWindow::new(50.0, 20.0);
        assert_eq!(window.map(0.0), 50.0);
        assert_eq!(window.map(0.5), 60.0);
        assert_eq!(window.map(1.0), 70.0);
        assert_eq!(window.map(3.0), 70.0);
        assert_eq!(window.map(-1.0), 50.0);
        assert_eq!(window.map(f64::NAN), 50.0);
    }

    #[test]
    fn test_progress_window_clamps_to_percent_range() {
        let window = ProgressWindow::new(90.0, 50.0);
        assert_eq!(window.map(1.0), 100.0);
    }

    #[test]
    fn test_gateway_ping_after() {
        let gateway = GatewayConfig::default();
        assert_eq!(gateway.ping_after(), Duration::from_secs(2));
    }

    #[test]
    fn test_order_dir() {
        let config = OrchestratorConfig::new().with_output_root("/data");
        assert_eq!(config.order_dir("ORD-1"), PathBuf::from("/data/ORD-1"));
    }

    #[test]
    fn test_out_of_range_durations_fall_back() {
        let config = OrchestratorConfig::from_json_str(
            r#"{"fetch": {"request_timeout_seconds": 1e30, "progress_interval_seconds": 1e300}}"#,
        )
        .unwrap();

        assert_eq!(config.fetch.timeout(), Duration::from_secs(15));
        assert_eq!(config.fetch.progress_interval(), Duration::from_secs(2));
        assert!(FetchConfig::new().with_timeout(-5.0).timeout() > Duration::ZERO);
    }
}
