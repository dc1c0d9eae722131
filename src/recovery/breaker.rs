//! Circuit Breaker
//!
//! One breaker per upstream service. Transitions only along
//! `Closed -> Open -> HalfOpen -> {Closed | Open}`; a half-open breaker admits
//! exactly one trial call. Each breaker is guarded by its own mutex, never
//! held across an await.

use crate::config::BreakerConfig;
use crate::metrics::Metrics;
use crate::upstream::{Completion, CompletionRequest, ErrorClass, ServiceId, Upstream, UpstreamError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failure weight of one ordinary failure, in half-units
const FULL_WEIGHT: u32 = 2;
/// Rate limiting counts half as much against the breaker
const RATE_LIMIT_WEIGHT: u32 = 1;

/// Circuit breaker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Normal operation
    Closed,
    /// Blocking all requests
    Open,
    /// Allowing one trial request through
    HalfOpen,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// Set after an auth/config failure; cleared by [`CircuitBreaker::enable`]
    pub disabled: bool,
}

#[derive(Debug)]
struct Inner {
    status: CircuitStatus,
    consecutive_failures: u32,
    weighted_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    disabled: bool,
    /// Bumped on every open and enable; outcomes from older permits are stale
    generation: u64,
}

/// Circuit breaker for one upstream service
#[derive(Debug)]
pub struct CircuitBreaker {
    service: ServiceId,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Consumed by `success`/`failure`. Dropping it unconsumed (the caller was
/// cancelled) records nothing and frees the half-open trial slot. A permit
/// issued before the breaker last opened only reports auth/config failures.
#[must_use]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial, self.generation);
    }

    pub fn failure(mut self, class: ErrorClass) {
        self.settled = true;
        self.breaker.record_failure(self.trial, self.generation, class);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == self.generation && inner.status == CircuitStatus::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(service: ServiceId, config: BreakerConfig) -> Self {
        Self {
            service,
            config,
            inner: Mutex::new(Inner {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                weighted_failures: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
                disabled: false,
                generation: 0,
            }),
        }
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    /// Open -> HalfOpen once the cooldown has elapsed
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.status == CircuitStatus::Open {
            if let Some(opened) = inner.opened_at {
                if now.duration_since(opened) >= self.config.cooldown {
                    inner.status = CircuitStatus::HalfOpen;
                    inner.trial_in_flight = false;
                    info!(service = %self.service, "Circuit breaker transitioning to half-open");
                }
            }
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.status = CircuitStatus::Open;
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.generation += 1;
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        CircuitState {
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            disabled: inner.disabled,
        }
    }

    /// Ask permission for one call
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, UpstreamError> {
        let mut inner = self.inner.lock();
        if inner.disabled {
            return Err(UpstreamError::Disabled(self.service));
        }
        self.refresh(&mut inner, Instant::now());

        let trial = match inner.status {
            CircuitStatus::Closed => false,
            CircuitStatus::Open => return Err(UpstreamError::CircuitOpen(self.service)),
            CircuitStatus::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(UpstreamError::CircuitOpen(self.service));
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: self,
            trial,
            generation: inner.generation,
            settled: false,
        })
    }

    fn record_success(&self, trial: bool, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!(service = %self.service, "Ignoring success from a call admitted before the breaker opened");
            return;
        }

        match inner.status {
            CircuitStatus::HalfOpen if trial => {
                inner.status = CircuitStatus::Closed;
                inner.consecutive_failures = 0;
                inner.weighted_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(service = %self.service, "Circuit breaker closed after successful trial");
            }
            CircuitStatus::Closed => {
                // Reset failure count on success
                inner.consecutive_failures = 0;
                inner.weighted_failures = 0;
            }
            CircuitStatus::HalfOpen | CircuitStatus::Open => {}
        }
    }

    fn record_failure(&self, trial: bool, generation: u64, class: ErrorClass) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        // Credentials stay bad no matter when the call was admitted
        if class == ErrorClass::AuthOrConfig && !inner.disabled {
            inner.disabled = true;
            warn!(service = %self.service, "Service disabled after auth/config failure");
        }
        if inner.generation != generation {
            debug!(service = %self.service, "Ignoring failure from a call admitted before the breaker opened");
            return;
        }

        match inner.status {
            CircuitStatus::Closed => {
                if let Some(last) = inner.last_failure {
                    if now.duration_since(last) > self.config.failure_window {
                        inner.consecutive_failures = 0;
                        inner.weighted_failures = 0;
                    }
                }
                inner.last_failure = Some(now);
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.weighted_failures = inner.weighted_failures.saturating_add(match class {
                    ErrorClass::RateLimited => RATE_LIMIT_WEIGHT,
                    _ => FULL_WEIGHT,
                });

                let limit = self.config.failure_threshold.saturating_mul(FULL_WEIGHT);
                if inner.weighted_failures >= limit {
                    self.open(&mut inner, now);
                    warn!(
                        service = %self.service,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitStatus::HalfOpen if trial => {
                // Immediate open on failure during half-open
                inner.last_failure = Some(now);
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                self.open(&mut inner, now);
                warn!(service = %self.service, "Circuit breaker reopened after half-open failure");
            }
            CircuitStatus::HalfOpen | CircuitStatus::Open => {}
        }
    }

    /// Mark the service unusable until [`enable`](Self::enable) is called
    pub fn disable(&self) {
        self.inner.lock().disabled = true;
        info!(service = %self.service, "Service disabled");
    }

    /// Clear the disabled flag after reconfiguration; failure history is reset
    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        inner.disabled = false;
        inner.status = CircuitStatus::Closed;
        inner.consecutive_failures = 0;
        inner.weighted_failures = 0;
        inner.last_failure = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.generation += 1;
        info!(service = %self.service, "Service re-enabled");
    }
}

/// One breaker per service, shared by the call stack and the orchestrator
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: HashMap<ServiceId, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: &BreakerConfig) -> Self {
        let breakers = ServiceId::ALL
            .into_iter()
            .map(|id| (id, Arc::new(CircuitBreaker::new(id, config.clone()))))
            .collect();
        Self { breakers }
    }

    pub fn get(&self, service: ServiceId) -> &CircuitBreaker {
        // Every ServiceId is registered in `new`
        &self.breakers[&service]
    }

    pub fn states(&self) -> Vec<(ServiceId, CircuitState)> {
        ServiceId::ALL
            .into_iter()
            .map(|id| (id, self.get(id).state()))
            .collect()
    }
}

/// Call-stack layer that consults the breaker before every attempt
pub struct BreakerLayer<U> {
    inner: U,
    registry: Arc<BreakerRegistry>,
    metrics: Arc<Metrics>,
}

impl<U> BreakerLayer<U> {
    pub fn new(inner: U, registry: Arc<BreakerRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner,
            registry,
            metrics,
        }
    }
}

#[async_trait]
impl<U: Upstream> Upstream for BreakerLayer<U> {
    async fn call(
        &self,
        service: ServiceId,
        request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError> {
        let permit = match self.registry.get(service).try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                self.metrics.record_breaker_rejection(service);
                return Err(rejection);
            }
        };

        match self.inner.call(service, request).await {
            Ok(completion) => {
                permit.success();
                Ok(completion)
            }
            Err(error) => {
                permit.failure(error.class());
                Err(error)
            }
        }
    }
}
