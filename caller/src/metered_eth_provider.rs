// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::CallerMetrics;
use crate::retry::{self, ExponentialStrategy, RetryError};
use ethers::providers::{Http, HttpClientError, JsonRpcClient, JsonRpcError, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::{ParseError, Url};

const MAX_RATE_LIMIT_RETRIES: usize = 3;

/// Request shaping for the metered provider.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    /// Upper bound on in-flight requests.
    pub max_concurrent_requests: usize,
    /// Minimum spacing between two requests. Zero disables spacing.
    pub min_request_delay: Duration,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            min_request_delay: Duration::ZERO,
        }
    }
}

/// HTTP JSON-RPC transport that records per-method metrics, bounds
/// concurrency and backs off on rate-limit responses.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    metrics: Arc<CallerMetrics>,
    semaphore: Arc<Semaphore>,
    min_request_delay: Duration,
    last_request_time: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

fn is_rate_limited<E: Debug>(error: &E) -> bool {
    // Some providers answer with a non standard body such as
    // {"code":-32005,"message":"Too Many Requests"} which only shows up in the
    // deserialization error text.
    let text = format!("{:?}", error).to_lowercase();
    text.contains("rate limit")
        || text.contains("429")
        || text.contains("too many requests")
        || text.contains("quota exceeded")
        || text.contains("-32005")
}

// 1s, 2s, 4s between rate-limited attempts.
fn rate_limit_backoff() -> ExponentialStrategy {
    ExponentialStrategy::new(Duration::ZERO, Duration::from_secs(4), Duration::ZERO)
}

/// Run `op`, repeating it while the provider reports rate limiting. Any
/// other outcome is returned as is. `None` means `cancel` fired first.
async fn with_rate_limit_retries<R, E, F, Fut>(
    cancel: &CancellationToken,
    method: &str,
    strategy: &ExponentialStrategy,
    mut op: F,
) -> Option<Result<R, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Debug,
{
    let mut attempt = 0;
    let result = retry::execute(cancel, MAX_RATE_LIMIT_RETRIES + 1, strategy, || {
        attempt += 1;
        let attempt = attempt;
        let request = op();
        async move {
            match request.await {
                Err(e) if is_rate_limited(&e) => {
                    warn!(
                        "Rate limited on {} ({}/{})",
                        method,
                        attempt,
                        MAX_RATE_LIMIT_RETRIES + 1
                    );
                    Err(e)
                }
                other => Ok(other),
            }
        }
    })
    .await;
    match result {
        Ok(outcome) => Some(outcome),
        Err(RetryError::FailedPermanently { last_error, .. }) => Some(Err(last_error)),
        Err(RetryError::Cancelled | RetryError::InvalidMaxAttempts(_)) => None,
    }
}

fn cancelled_request(method: &str) -> HttpClientError {
    HttpClientError::JsonRpcError(JsonRpcError {
        code: -32000,
        message: format!("{} cancelled by shutdown", method),
        data: None,
    })
}

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        // The semaphore is never closed, so a failed acquire only drops the limit.
        let _permit = self.semaphore.acquire().await.ok();

        if !self.min_request_delay.is_zero() {
            let mut last_request = self.last_request_time.lock().await;
            let elapsed = last_request.elapsed();
            if elapsed < self.min_request_delay {
                tokio::time::sleep(self.min_request_delay - elapsed).await;
            }
            *last_request = Instant::now();
        }

        self.metrics
            .eth_rpc_queries
            .with_label_values(&[method])
            .inc();
        let _guard = self
            .metrics
            .eth_rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();

        let inner = &self.inner;
        let params = &params;
        let result: Result<R, HttpClientError> = with_rate_limit_retries(
            &self.cancel,
            method,
            &rate_limit_backoff(),
            || inner.request(method, params),
        )
        .await
        .unwrap_or_else(|| Err(cancelled_request(method)));

        self.metrics
            .eth_node_connected
            .set(if result.is_ok() { 1 } else { 0 });
        result
    }
}

impl MeteredEthHttpProvider {
    /// Rate-limit backoff stops once `cancel` fires.
    pub fn new(
        url: impl Into<Url>,
        metrics: Arc<CallerMetrics>,
        limits: RequestLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Http::new(url),
            metrics,
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent_requests.max(1))),
            min_request_delay: limits.min_request_delay,
            last_request_time: Arc::new(Mutex::new(
                Instant::now()
                    .checked_sub(limits.min_request_delay)
                    .unwrap_or_else(Instant::now),
            )),
            cancel,
        }
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    metrics: Arc<CallerMetrics>,
    limits: RequestLimits,
    cancel: CancellationToken,
) -> Result<Provider<MeteredEthHttpProvider>, ParseError> {
    let http_provider = MeteredEthHttpProvider::new(Url::parse(url)?, metrics, limits, cancel);
    Ok(Provider::new(http_provider))
}
