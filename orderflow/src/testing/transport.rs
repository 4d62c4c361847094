//! A scripted transport for fetcher tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::FetchConfig;
use crate::errors::FetchError;
use crate::fetch::{BoundedFetcher, FetchRequest, NoCache, RetryConfig, Transport, TransportResponse};

/// Answers requests from a script instead of the network.
///
/// Responses registered with [`ScriptedTransport::with_response`] are
/// matched by URL suffix and consumed in order; anything unmatched gets
/// the default response, or a transport error when there is none.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    default: Option<TransportResponse>,
    scripted: Mutex<Vec<(String, VecDeque<TransportResponse>)>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedTransport {
    /// Creates a transport with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose every call fails.
    #[must_use]
    pub fn failing() -> Self {
        Self::default()
    }

    /// Sets the response for unscripted requests.
    #[must_use]
    pub fn with_default(mut self, response: TransportResponse) -> Self {
        self.default = Some(response);
        self
    }

    /// Queues a response for URLs ending in `suffix`.
    #[must_use]
    pub fn with_response(self, suffix: impl Into<String>, response: TransportResponse) -> Self {
        let suffix = suffix.into();
        {
            let mut scripted = self.scripted.lock();
            match scripted.iter_mut().find(|(s, _)| *s == suffix) {
                Some((_, queue)) => queue.push_back(response),
                None => scripted.push((suffix, VecDeque::from([response]))),
            }
        }
        self
    }

    /// Delays every response.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of requests received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of requests in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every request received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    fn next_response(&self, url: &str) -> Option<TransportResponse> {
        let mut scripted = self.scripted.lock();
        scripted
            .iter_mut()
            .find(|(suffix, queue)| url.ends_with(suffix.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front())
            .or_else(|| self.default.clone())
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, request: FetchRequest) -> Result<TransportResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(self.in_flight.clone());
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.next_response(&request.url).ok_or_else(|| FetchError::Transport {
            source_name: request.source_name,
            message: "connection refused".to_string(),
        })
    }
}

/// A fetcher that never reaches the network and never caches.
///
/// Every key resolves to its source's default shape.
#[must_use]
pub fn offline_fetcher() -> Arc<BoundedFetcher> {
    let config = FetchConfig::new().with_retry(RetryConfig::immediate());
    Arc::new(BoundedFetcher::new(
        config,
        Arc::new(ScriptedTransport::failing()),
        Arc::new(NoCache),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> FetchRequest {
        FetchRequest {
            source_name: "kegg".into(),
            url: url.into(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let transport = ScriptedTransport::new()
            .with_default(TransportResponse::ok("default"))
            .with_response("/AKT1", TransportResponse::new(429, ""));

        assert_eq!(transport.get(request("http://x/AKT1")).await.unwrap().status, 429);
        assert_eq!(transport.get(request("http://x/AKT1")).await.unwrap().body, "default");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failing_transport() {
        let err = ScriptedTransport::failing()
            .get(request("http://x/AKT1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
