//! Rate limiting and retry logic for media-server calls
//!
//! Every provider shares one pooled `reqwest::Client`; each strategy wraps it in a
//! [RateLimitedClient] so a single slow server cannot be hammered. Calls that fail
//! with a transient [ProviderError] are retried with exponential backoff.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::services::providers::ProviderError;

/// Empty query string for [RateLimitedClient::get]
pub const NO_QUERY: &[(&str, &str)] = &[];

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,
    /// Burst capacity (allows short bursts above the rate)
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_size: 20,
        }
    }
}

/// A rate-limited HTTP client wrapper
#[derive(Clone)]
pub struct RateLimitedClient {
    client: Client,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    name: String,
}

impl RateLimitedClient {
    /// Wrap an existing (shared) client with its own limiter
    pub fn new(name: &str, client: Client, config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            client,
            limiter: Arc::new(RateLimiter::direct(quota)),
            name: name.to_string(),
        }
    }

    /// Build the process-wide client with a fixed per-call timeout
    pub fn build_shared_client(timeout: Duration) -> anyhow::Result<Client> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("media-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(client)
    }

    /// Wait for rate limit and make a GET request. Non-2xx statuses become errors.
    pub async fn get<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &HeaderMap,
        query: &T,
    ) -> Result<Response, ProviderError> {
        self.wait_for_permit().await;
        debug!(client = %self.name, url = %url, "Making rate-limited GET request");

        let response = self
            .client
            .get(url)
            .headers(headers.clone())
            .query(query)
            .send()
            .await?;

        response.error_for_provider().await
    }

    /// GET and decode a JSON body
    pub async fn get_json<R, T>(
        &self,
        url: &str,
        headers: &HeaderMap,
        query: &T,
    ) -> Result<R, ProviderError>
    where
        R: DeserializeOwned,
        T: serde::Serialize + ?Sized,
    {
        let response = self.get(url, headers, query).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Wait for a rate limit permit
    pub async fn wait_for_permit(&self) {
        self.limiter.until_ready().await;
    }
}

/// Retry configuration.
///
/// `max_retries` counts attempts after the first, so the default makes at most three
/// calls, sleeping 2s then 4s between them.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_interval: Duration,
    /// Maximum backoff duration
    pub max_interval: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a jitter-free ExponentialBackoff from this config
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: 0.0,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        ProviderError::is_transient(self)
    }
}

/// Execute an async operation, retrying transient failures.
///
/// Terminal errors are returned immediately. After the retries are spent the last
/// error is returned.
pub async fn retry_async<T, E, Fut, F>(
    operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let mut attempts = 0;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => {
                debug!(
                    operation = %operation_name,
                    attempt = attempts,
                    error = %e,
                    "Operation failed with a terminal error"
                );
                return Err(e);
            }
            Err(e) => {
                if attempts > config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts = attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                if let Some(duration) = backoff.next_backoff() {
                    let retry_ms: u128 = duration.as_millis();
                    warn!(
                        operation = %operation_name,
                        attempt = attempts,
                        error = %e,
                        retry_in_ms = retry_ms,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

/// Helper trait for classifying HTTP responses
#[allow(async_fn_in_trait)]
pub trait ResponseExt: Sized {
    /// Pass 2xx responses through, turn everything else into a [ProviderError]
    async fn error_for_provider(self) -> Result<Self, ProviderError>;
}

impl ResponseExt for Response {
    async fn error_for_provider(self) -> Result<Self, ProviderError> {
        let status = self.status();
        if status.is_success() {
            return Ok(self);
        }
        let body = self.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            body.chars().take(200).collect()
        };
        Err(ProviderError::from_status(status.as_u16(), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);

        let mut backoff = config.to_backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_async(
            || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProviderError::from_status(500, "boom"))
                } else {
                    Ok(n)
                }
            },
            &fast_config(),
            "test",
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_not_found() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_async(
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::from_status(404, "missing"))
            },
            &fast_config(),
            "test",
        )
        .await;

        assert_eq!(result.unwrap_err().status(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_async(
            || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Connection(format!("attempt {}", n)))
            },
            &fast_config(),
            "test",
        )
        .await;

        assert_eq!(
            result,
            Err(ProviderError::Connection("attempt 2".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
