//! Shared HTTP session with bounded retries for transient failures.
//!
//! This layer only repeats a single request; the attempt loop in the
//! downloader retries whole transfers on top of it.

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::config::DownloaderConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra tries after the first request.
    pub retries: u32,
    /// Sleep before retry `n` is `backoff_factor * 2^(n-1)`.
    pub backoff_factor: Duration,
    pub status_forcelist: Vec<StatusCode>,
    pub allowed_methods: Vec<Method>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_factor: Duration::from_secs(1),
            status_forcelist: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
            allowed_methods: vec![Method::HEAD, Method::GET, Method::OPTIONS],
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    pub fn with_retries(mut self, retries: u32, backoff_factor: Duration) -> Self {
        self.retries = retries;
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.backoff_factor.saturating_mul(1 << exponent)
    }

    fn retries_status(&self, status: StatusCode) -> bool {
        self.status_forcelist.contains(&status)
    }
}

/// One connection pool shared by every download of a coordinator.
#[derive(Clone)]
pub struct HttpSession {
    client: Client,
    policy: RetryPolicy,
}

impl HttpSession {
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            policy: config.http_retry.clone(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Sends the request, repeating it on connection errors, timeouts and
    /// retryable statuses while the policy allows. The last response is
    /// returned as is, whatever its status.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let retryable_method = request
            .try_clone()
            .and_then(|r| r.build().ok())
            .map(|r| self.policy.allowed_methods.contains(r.method()))
            .unwrap_or(false);
        let budget = if retryable_method { self.policy.retries } else { 0 };

        let mut retry = 0;
        loop {
            let attempt = request
                .try_clone()
                .ok_or_else(|| anyhow!("request body cannot be replayed"))?;

            match attempt.send().await {
                Ok(response) if retry < budget && self.policy.retries_status(response.status()) => {
                    debug!(status = %response.status(), retry, "transient status, retrying");
                }
                Ok(response) => return Ok(response),
                Err(e) if retry < budget && (e.is_timeout() || e.is_connect()) => {
                    debug!(retry, "transient request error, retrying: {}", e);
                }
                Err(e) => return Err(e).context("HTTP request failed"),
            }

            retry += 1;
            tokio::time::sleep(self.policy.backoff(retry)).await;
        }
    }

    pub async fn probe_head(&self, url: &str, timeout: Duration) -> Result<Response> {
        let request = self
            .client
            .head(url)
            .header(reqwest::header::ACCEPT_ENCODING, "identity")
            .timeout(timeout);
        let response = self.send(request).await?;
        response
            .error_for_status()
            .context("HEAD request rejected")
    }
}
