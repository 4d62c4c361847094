//! The network seam underneath the bounded fetcher.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::FetchError;

/// One outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// The source being queried.
    pub source_name: String,
    /// The fully built URL.
    pub url: String,
    /// Per-call timeout.
    pub timeout: Duration,
}

/// A raw response from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    pub body: String,
}

impl TransportResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A 200 response.
    #[must_use]
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to external sources.
///
/// Implementations report only transport-level failures as errors; every
/// HTTP status, including 4xx and 5xx, comes back as a response.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a GET request.
    async fn get(&self, request: FetchRequest) -> Result<TransportResponse, FetchError>;
}

/// HTTP transport built on reqwest.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl ReqwestTransport {
    /// Creates a transport with a fresh client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport around an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: FetchRequest) -> Result<TransportResponse, FetchError> {
        let response = self
            .client
            .get(&request.url)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&request, &e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&request, &e))?;

        Ok(TransportResponse { status, body })
    }
}

#[cfg(feature = "http")]
fn classify_reqwest_error(request: &FetchRequest, error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            source_name: request.source_name.clone(),
            timeout: request.timeout,
        }
    } else {
        FetchError::Transport {
            source_name: request.source_name.clone(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success_range() {
        assert!(TransportResponse::ok("{}").is_success());
        assert!(TransportResponse::new(204, "").is_success());
        assert!(!TransportResponse::new(404, "").is_success());
        assert!(!TransportResponse::new(503, "").is_success());
    }

    #[tokio::test]
    async fn test_mock_transport() {
        let mut mock = MockTransport::new();
        mock.expect_get()
            .withf(|req| req.url.ends_with("/P31749"))
            .times(1)
            .returning(|_| Ok(TransportResponse::ok(r#"{"ok": true}"#)));

        let response = mock
            .get(FetchRequest {
                source_name: "uniprot".into(),
                url: "http://x/tools/uniprot/P31749".into(),
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 200);
    }
}
