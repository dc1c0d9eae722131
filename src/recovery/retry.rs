//! Retry with exponential backoff
//!
//! Wraps the breaker layer: every attempt passes through the breaker, so a
//! breaker that opens mid-sequence stops further attempts.

use crate::metrics::Metrics;
use crate::upstream::{Completion, CompletionRequest, ErrorClass, ServiceId, Upstream, UpstreamError};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter fraction (0.0 - 1.0)
    pub jitter_fraction: f64,
    /// Fixed wait after a rate-limit response without Retry-After
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.2,
            rate_limit_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Fail-fast policy: one attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `min(max_delay, base_delay * multiplier^attempt)`, before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    /// Calculate delay after the failed attempt `attempt` (zero-based)
    pub fn delay_for_attempt(&self, attempt: u32, error: &UpstreamError) -> Duration {
        if let UpstreamError::RateLimited { retry_after } = error {
            return retry_after.unwrap_or(self.rate_limit_delay).min(self.max_delay);
        }

        let capped = self.backoff(attempt).as_secs_f64();
        if self.jitter_fraction <= 0.0 {
            return Duration::from_secs_f64(capped);
        }

        let spread = self.jitter_fraction.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Call-stack layer that retries transient failures
pub struct RetryLayer<U> {
    inner: U,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl<U> RetryLayer<U> {
    pub fn new(inner: U, policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            inner,
            policy,
            metrics,
        }
    }
}

#[async_trait]
impl<U: Upstream> Upstream for RetryLayer<U> {
    async fn call(
        &self,
        service: ServiceId,
        request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = self.inner.call(service, request).await;
            let latency = started.elapsed();

            let error = match result {
                Ok(completion) => {
                    self.metrics.record_attempt(service, latency, true);
                    debug!(
                        service = %service,
                        attempt = attempt + 1,
                        latency_ms = latency.as_millis() as u64,
                        "Upstream call succeeded"
                    );
                    return Ok(completion);
                }
                Err(error) => error,
            };

            let class = error.class();
            if class == ErrorClass::Rejected {
                // The breaker refused before the provider was reached
                return Err(error);
            }

            self.metrics.record_attempt(service, latency, false);
            attempt += 1;

            if !class.is_retryable() {
                warn!(service = %service, attempt, error = %error, "Non-retryable upstream failure");
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(service = %service, attempts = attempt, error = %error, "Retries exhausted");
                return Err(UpstreamError::Exhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.policy.delay_for_attempt(attempt - 1, &error);
            debug!(
                service = %service,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying upstream call"
            );
            self.metrics.record_retry(service);
            tokio::time::sleep(delay).await;
        }
    }
}
