//! The bounded external fetcher.
//!
//! `fetch` and `fetch_batch` never return errors. Every failure is logged
//! and replaced by the source's default shape.

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::cache::{cache_key, CacheStore};
use super::progress::{BatchProgress, BatchProgressCallback, ProgressThrottle};
use super::retry::with_retry;
use super::source::SourceDescriptor;
use super::transport::{FetchRequest, Transport, TransportResponse};
use crate::config::FetchConfig;
use crate::errors::FetchError;

/// Counters describing fetcher activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    /// Requests handed to the transport, including retries.
    pub network_calls: u64,
    /// Lookups answered from the cache.
    pub cache_hits: u64,
    /// Lookups that ended with the default shape.
    pub defaults: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    network_calls: AtomicU64,
    cache_hits: AtomicU64,
    defaults: AtomicU64,
}

/// How a single lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Cached,
    Fetched,
    Defaulted,
}

/// Concurrency-limited client over many external sources.
///
/// One instance is shared by every stage body in a process; its per-source
/// semaphores cap in-flight requests so a slow source cannot starve others.
pub struct BoundedFetcher {
    config: FetchConfig,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CacheStore>,
    limits: DashMap<String, Arc<Semaphore>>,
    stats: StatsCounters,
}

impl BoundedFetcher {
    /// Creates a fetcher.
    pub fn new(config: FetchConfig, transport: Arc<dyn Transport>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            config,
            transport,
            cache,
            limits: DashMap::new(),
            stats: StatsCounters::default(),
        }
    }

    /// The fetch configuration.
    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// A snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> FetchStats {
        FetchStats {
            network_calls: self.stats.network_calls.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            defaults: self.stats.defaults.load(Ordering::Relaxed),
        }
    }

    /// Fetches one key, consulting the cache first.
    pub async fn fetch(&self, source: &SourceDescriptor, key: &str) -> Value {
        self.fetch_one(source, key).await.0
    }

    /// Fetches many keys from one source.
    ///
    /// Keys are split into sub-batches that run on a pool of `max_workers`.
    /// The result holds one entry per distinct key; failed keys map to the
    /// source's default shape.
    pub async fn fetch_batch(
        &self,
        source: &SourceDescriptor,
        keys: &[String],
        max_workers: usize,
        on_progress: Option<BatchProgressCallback>,
    ) -> HashMap<String, Value> {
        let total = keys.len();
        let label = source.name().to_string();
        let mut progress = BatchProgress::new(total);
        let mut throttle = ProgressThrottle::new(self.config.progress_interval());
        let mut results = HashMap::with_capacity(total);

        if let Some(ref callback) = on_progress {
            if throttle.should_emit(total == 0) {
                callback(0, total, &label);
            }
        }
        if total == 0 {
            return results;
        }

        let chunk_size = self.config.effective_sub_batch_size();
        let chunk_count = total.div_ceil(chunk_size);
        info!(
            source = %label,
            keys = total,
            sub_batches = chunk_count,
            max_workers,
            "Starting batch fetch"
        );

        // Collected eagerly; a lazy `map` over borrowed chunks makes this future !Send.
        let pending: Vec<_> = keys
            .chunks(chunk_size)
            .map(|chunk| self.fetch_sub_batch(source, chunk))
            .collect();
        let mut sub_batches = stream::iter(pending).buffer_unordered(max_workers.max(1));

        while let Some(batch) = sub_batches.next().await {
            for (key, value, outcome) in batch {
                progress.done += 1;
                match outcome {
                    Outcome::Cached => progress.cache_hits += 1,
                    Outcome::Defaulted => progress.defaults += 1,
                    Outcome::Fetched => {}
                }
                results.insert(key, value);
            }
            if let Some(ref callback) = on_progress {
                if throttle.should_emit(progress.is_complete()) {
                    callback(progress.done, total, &label);
                }
            }
        }

        info!(
            source = %label,
            keys = total,
            cache_hits = progress.cache_hits,
            defaults = progress.defaults,
            "Batch fetch finished"
        );
        results
    }

    async fn fetch_sub_batch(
        &self,
        source: &SourceDescriptor,
        keys: &[String],
    ) -> Vec<(String, Value, Outcome)> {
        let lookups: Vec<_> = keys
            .iter()
            .map(|key| async move {
                let (value, outcome) = self.fetch_one(source, key).await;
                (key.clone(), value, outcome)
            })
            .collect();
        futures::future::join_all(lookups).await
    }

    async fn fetch_one(&self, source: &SourceDescriptor, key: &str) -> (Value, Outcome) {
        let normalized = source.normalize(key);
        let cache_key = cache_key(source.name(), &normalized);

        match self.cache.get(&cache_key).await {
            Ok(Some(value)) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(source = source.name(), key = %normalized, "Cache hit");
                return (value, Outcome::Cached);
            }
            Ok(None) => {}
            Err(e) => warn!(source = source.name(), error = %e, "Cache read failed"),
        }

        let limit = self.limit_for(source);
        let Ok(_permit) = limit.acquire().await else {
            return self.defaulted(source, &normalized);
        };

        let label = format!("{}:{}", source.name(), normalized);
        let result = with_retry(&self.config.retry, &label, |_attempt| {
            self.request(source, &normalized)
        })
        .await;

        match result {
            Ok(value) => {
                let ttl = source.cache_policy().ttl(self.config.refreshable_ttl());
                if let Err(e) = self.cache.set(&cache_key, value.clone(), ttl).await {
                    warn!(source = source.name(), error = %e, "Cache write failed");
                }
                (value, Outcome::Fetched)
            }
            Err(FetchError::NotFound { .. }) => {
                debug!(source = source.name(), key = %normalized, "Not found, using default");
                self.defaulted(source, &normalized)
            }
            Err(e) => {
                warn!(source = source.name(), key = %normalized, error = %e, "Fetch failed, using default");
                self.defaulted(source, &normalized)
            }
        }
    }

    async fn request(&self, source: &SourceDescriptor, normalized: &str) -> Result<Value, FetchError> {
        let request = FetchRequest {
            source_name: source.name().to_string(),
            url: source.endpoint(&self.config.base_url, normalized),
            timeout: self.config.timeout(),
        };
        self.stats.network_calls.fetch_add(1, Ordering::Relaxed);

        let response = tokio::time::timeout(request.timeout, self.transport.get(request.clone()))
            .await
            .map_err(|_| FetchError::Timeout {
                source_name: request.source_name.clone(),
                timeout: request.timeout,
            })??;

        classify(source, normalized, &response)
    }

    fn defaulted(&self, source: &SourceDescriptor, normalized: &str) -> (Value, Outcome) {
        self.stats.defaults.fetch_add(1, Ordering::Relaxed);
        (source.default_value(normalized), Outcome::Defaulted)
    }

    fn limit_for(&self, source: &SourceDescriptor) -> Arc<Semaphore> {
        self.limits
            .entry(source.name().to_string())
            .or_insert_with(|| {
                let permits = source
                    .max_concurrency()
                    .unwrap_or(self.config.per_source_concurrency)
                    .max(1);
                Arc::new(Semaphore::new(permits))
            })
            .clone()
    }
}

fn classify(
    source: &SourceDescriptor,
    normalized: &str,
    response: &TransportResponse,
) -> Result<Value, FetchError> {
    match response.status {
        404 => Err(FetchError::NotFound {
            source_name: source.name().to_string(),
            key: normalized.to_string(),
        }),
        429 => Err(FetchError::RateLimited {
            source_name: source.name().to_string(),
        }),
        _ if response.is_success() => {
            source
                .parse(normalized, &response.body)
                .map_err(|message| FetchError::Parse {
                    source_name: source.name().to_string(),
                    message,
                })
        }
        status => Err(FetchError::Status {
            source_name: source.name().to_string(),
            status,
        }),
    }
}
