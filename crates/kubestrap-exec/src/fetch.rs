//! HTTP fetch for release discovery
//!
//! Callers decide what a non-2xx status means; the fetcher only reports it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument};

/// Status and body of one HTTP GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl FetchResponse {
    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport failures; HTTP error statuses are not errors here
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// Could not build the HTTP client
    #[error("HTTP client setup failed: {0}")]
    Client(String),

    /// Request did not complete
    #[error("request to {url} failed: {reason}")]
    Request {
        /// Requested URL
        url: String,
        /// Underlying error
        reason: String,
    },

    /// Request exceeded its deadline
    #[error("request to {url} timed out")]
    Timeout {
        /// Requested URL
        url: String,
    },
}

/// One-shot HTTP GET
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch `url`, returning whatever status the server answered with
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

/// `HttpFetcher` backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    /// Create a fetcher whose requests fail after `timeout`
    ///
    /// # Errors
    /// Returns `FetchError::Client` if the TLS backend cannot be initialized
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("kubestrap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing `reqwest::Client`
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Request {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| FetchError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        debug!(status, bytes = body.len(), "fetch completed");

        Ok(FetchResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        let ok = FetchResponse {
            status: 204,
            body: String::new(),
        };
        let err = FetchResponse {
            status: 500,
            body: "oops".to_string(),
        };
        let redirect = FetchResponse {
            status: 302,
            body: String::new(),
        };
        assert!(ok.is_success());
        assert!(!err.is_success());
        assert!(!redirect.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_request_error() {
        let fetcher = ReqwestFetcher::new(Duration::from_secs(2)).unwrap();
        let err = fetcher.fetch("http://127.0.0.1:9/releases").await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Request { .. } | FetchError::Timeout { .. }
        ));
    }
}
