//! Error Recovery System
//!
//! Resilience wrappers around the upstream call primitive:
//! - Circuit breaker per service (closed / open / half-open, plus disabled)
//! - Exponential backoff with jitter for retryable failures
//! - Longer fixed waits for rate limiting
//!
//! The two wrappers are independent layers; [`resilient`] stacks them in the
//! order the orchestrator uses.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerLayer, BreakerPermit, BreakerRegistry, CircuitBreaker, CircuitState, CircuitStatus};
pub use retry::{RetryLayer, RetryPolicy};

use crate::metrics::Metrics;
use std::sync::Arc;

/// `RetryLayer` over `BreakerLayer` over `inner`
pub fn resilient<U>(
    inner: U,
    registry: Arc<BreakerRegistry>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
) -> RetryLayer<BreakerLayer<U>> {
    RetryLayer::new(
        BreakerLayer::new(inner, registry, metrics.clone()),
        policy,
        metrics,
    )
}
