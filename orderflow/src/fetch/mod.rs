//! Bounded external fetcher.
//!
//! A uniform single-key and batch interface over slow, rate-limited
//! external sources:
//! - [`SourceDescriptor`] captures what differs between sources
//! - [`CacheStore`] holds results shared across every order
//! - [`RetryConfig`] drives backoff for transient failures
//! - [`Transport`] is the network seam
//! - [`BoundedFetcher`] ties them together with per-source concurrency caps

mod cache;
mod client;
mod progress;
mod retry;
pub mod source;
mod transport;

pub use cache::{cache_key, CacheStore, InMemoryCacheStore, NoCache, MAX_KEY_LEN};
pub use client::{BoundedFetcher, FetchStats};
pub use progress::{BatchProgress, BatchProgressCallback, ProgressThrottle};
pub use retry::{with_retry, JitterStrategy, RetryConfig, RetryDecision};
pub use source::{CachePolicy, SourceDescriptor};
#[cfg(feature = "http")]
pub use transport::ReqwestTransport;
pub use transport::{FetchRequest, Transport, TransportResponse};
