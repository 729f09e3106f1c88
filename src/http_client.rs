//! HTTP Client Module
//!
//! Wraps a reqwest client with:
//! - A shared sliding-window rate limiter (acquired before every attempt)
//! - 429-aware retries honoring `Retry-After`, else exponential backoff
//!
//! Non-429 failures and exhausted retries are handed back as responses so
//! callers can branch on the status. Only transport faults become errors.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IngestionError, Result};
use crate::metrics;
use crate::rate_limiter::SlidingWindowLimiter;

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout
    pub request_timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Retries after an HTTP 429
    pub max_retries: u32,
    /// First backoff delay when no Retry-After is given
    pub initial_retry_delay: Duration,
    /// Maximum retry delay
    pub max_retry_delay: Duration,
    /// Retry multiplier for exponential backoff
    pub retry_multiplier: f64,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 2,
            initial_retry_delay: Duration::from_millis(1200),
            max_retry_delay: Duration::from_secs(60),
            retry_multiplier: 2.0,
            user_agent: format!("castboard-ingest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpClientConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_retry_delay: config.retry_base(),
            ..Default::default()
        }
    }
}

/// Rate-limited HTTP client with bounded 429 retries
pub struct RateLimitedClient {
    /// Inner reqwest client
    client: Client,
    /// Process-wide limiter, shared with every caller of this client
    limiter: Arc<SlidingWindowLimiter>,
    /// Configuration
    config: HttpClientConfig,
}

impl RateLimitedClient {
    /// Creates a new client around a shared limiter
    pub fn new(config: HttpClientConfig, limiter: Arc<SlidingWindowLimiter>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(IngestionError::HttpError)?;

        Ok(Self {
            client,
            limiter,
            config,
        })
    }

    /// Gets the inner reqwest client (for building requests)
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Exponential backoff without jitter, so waits are predictable
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_retry_delay)
            .with_max_interval(self.config.max_retry_delay)
            .with_multiplier(self.config.retry_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Executes a request, retrying on 429 while retries remain.
    ///
    /// `endpoint` is a short label for logs and metrics.
    pub async fn call(&self, endpoint: &'static str, request: Request) -> Result<Response> {
        let mut backoff = self.create_backoff();
        let mut retries_left = self.config.max_retries;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let waited = self.limiter.acquire().await;
            if !waited.is_zero() {
                metrics::record_rate_limit_wait(waited.as_secs_f64());
            }

            // Bodies are never streamed here, so a clone is always possible
            let req = request.try_clone().ok_or_else(|| {
                IngestionError::InvalidInput("request body cannot be cloned for retry".to_string())
            })?;

            debug!(
                endpoint,
                url = %req.url(),
                attempt,
                "Executing HTTP request"
            );

            let response = self.client.execute(req).await?;
            let status = response.status();
            metrics::record_upstream_request(endpoint, status.as_u16());

            if status != StatusCode::TOO_MANY_REQUESTS || retries_left == 0 {
                if !status.is_success() {
                    warn!(endpoint, status = %status, attempt, "Upstream returned non-success status");
                }
                return Ok(response);
            }

            let wait = retry_after(&response)
                .map(|advised| advised.min(self.config.max_retry_delay))
                .or_else(|| backoff.next_backoff())
                .unwrap_or(self.config.max_retry_delay);
            retries_left -= 1;
            metrics::record_retry(endpoint);

            warn!(
                endpoint,
                attempt,
                retries_left,
                wait_ms = wait.as_millis() as u64,
                "Rate limited by upstream, backing off"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

/// Reads a server-advised wait in whole seconds
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(max_retries: u32) -> RateLimitedClient {
        let config = HttpClientConfig {
            max_retries,
            initial_retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        RateLimitedClient::new(config, Arc::new(SlidingWindowLimiter::per_minute(1000))).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = HttpClientConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_retry_delay, Duration::from_millis(1200));
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let client = RateLimitedClient::new(
            HttpClientConfig::default(),
            Arc::new(SlidingWindowLimiter::per_minute(10)),
        )
        .unwrap();
        let mut backoff = client.create_backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(2400)));
    }

    #[tokio::test]
    async fn test_retries_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cast/search"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cast/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let client = client(2);
        let request = client
            .inner()
            .get(format!("{}/cast/search", server.uri()))
            .build()
            .unwrap();

        let response = client.call("search", request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_after_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let config = HttpClientConfig {
            max_retries: 1,
            max_retry_delay: Duration::from_millis(200),
            ..Default::default()
        };
        let client =
            RateLimitedClient::new(config, Arc::new(SlidingWindowLimiter::per_minute(1000))).unwrap();
        let request = client.inner().get(server.uri()).build().unwrap();

        let started = std::time::Instant::now();
        let response = client.call("search", request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(2), "waited {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_429_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client(2);
        let request = client.inner().get(server.uri()).build().unwrap();

        let response = client.call("search", request).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // One initial attempt plus two retries
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client(2);
        let request = client.inner().get(server.uri()).build().unwrap();

        let response = client.call("bulk", request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_fault_is_an_error() {
        let client = client(0);
        // Port 9 (discard) on localhost is expected to refuse connections
        let request = client.inner().get("http://127.0.0.1:9/").build().unwrap();

        let result = client.call("search", request).await;
        assert!(matches!(result, Err(IngestionError::HttpError(_))));
    }
}
