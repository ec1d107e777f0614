//! HTTP client shared by source backends and metadata providers.
//!
//! Wraps `reqwest` with:
//! - A configurable default timeout
//! - A user-agent
//! - A classification of status codes into retryable vs. permanent failures
//! - A [`crate::network::retry_async`] wrapper around every request, so a
//!   transient transport error or a retryable status (408/429/5xx) is
//!   retried with backoff before the caller ever sees it

use crate::error::{IngestError, Result};
use crate::network::retry::{retry_async, RetryConfig};
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = "ns-pond-ingestion/0.1";

/// Thin HTTP client wrapper used throughout the pipeline's network-facing code.
pub struct HttpClient {
    client: Client,
    default_timeout: Duration,
    retry_config: RetryConfig,
}

impl HttpClient {
    /// Create a new HTTP client with the default timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a new HTTP client with a custom default timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| IngestError::Network {
                message: format!("failed to build HTTP client: {e}"),
                cause: None,
            })?;

        Ok(Self {
            client,
            default_timeout: timeout,
            retry_config: RetryConfig::default(),
        })
    }

    /// Override the retry policy (defaults to 3 attempts, 1s base delay).
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Access the underlying reqwest client, e.g. to attach custom headers.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Make a GET request, retrying transient failures with backoff.
    pub async fn get(&self, url: &str) -> Result<Response> {
        let (result, _stats) = retry_async(
            &self.retry_config,
            || async {
                let response = self.client.get(url).send().await.map_err(|e| IngestError::Network {
                    message: format!("GET {url} failed: {e}"),
                    cause: Some(e.to_string()),
                })?;
                self.check_response_status(response, url).await
            },
            IngestError::is_retryable,
        )
        .await;
        result
    }

    /// Make a GET request with additional headers (e.g. API keys, contact emails).
    pub async fn get_with_headers(&self, url: &str, headers: &[(String, String)]) -> Result<Response> {
        let (result, _stats) = retry_async(
            &self.retry_config,
            || async {
                let mut request = self.client.get(url);
                for (key, value) in headers {
                    request = request.header(key.as_str(), value.as_str());
                }
                let response = request.send().await.map_err(|e| IngestError::Network {
                    message: format!("GET {url} failed: {e}"),
                    cause: Some(e.to_string()),
                })?;
                self.check_response_status(response, url).await
            },
            IngestError::is_retryable,
        )
        .await;
        result
    }

    /// Make a POST request with a JSON body (used by LLM and upload clients).
    pub async fn post_json<T: serde::Serialize>(&self, url: &str, body: &T) -> Result<Response> {
        let (result, _stats) = retry_async(
            &self.retry_config,
            || async {
                let response = self
                    .client
                    .post(url)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| IngestError::Network {
                        message: format!("POST {url} failed: {e}"),
                        cause: Some(e.to_string()),
                    })?;
                self.check_response_status(response, url).await
            },
            IngestError::is_retryable,
        )
        .await;
        result
    }

    /// Whether an HTTP status code should trigger a retry.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
    }

    /// Whether an HTTP status code indicates a permanent failure (no retry).
    pub fn is_permanent_failure(status: StatusCode) -> bool {
        matches!(status.as_u16(), 400 | 401 | 403 | 404)
    }

    async fn check_response_status(&self, response: Response, url: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            return Err(IngestError::RateLimited {
                service: extract_domain(url),
                retry_after_secs: retry_after,
            });
        }

        if Self::is_retryable_status(status) {
            return Err(IngestError::Network {
                message: format!("{url} returned retryable status {status}"),
                cause: None,
            });
        }

        // Permanent failures are surfaced to the caller as the response
        // itself, since the body may still carry useful error detail.
        Ok(response)
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new().expect("failed to create default HTTP client")
    }
}

/// Extract the host from a URL, for logging and rate-limit attribution.
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.host_str().unwrap_or("unknown").to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://api.crossref.org/works/10.1/x"), "api.crossref.org");
        assert_eq!(extract_domain("invalid-url"), "unknown");
    }

    #[test]
    fn test_retryable_status_codes() {
        assert!(HttpClient::is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(HttpClient::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(HttpClient::is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!HttpClient::is_retryable_status(StatusCode::OK));
        assert!(!HttpClient::is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_permanent_failure_status_codes() {
        assert!(HttpClient::is_permanent_failure(StatusCode::NOT_FOUND));
        assert!(!HttpClient::is_permanent_failure(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_client_with_timeout() {
        let client = HttpClient::with_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(client.default_timeout, Duration::from_secs(5));
    }
}
