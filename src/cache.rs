//! Response Cache
//!
//! Fingerprint-keyed cache with single-flight deduplication in front of the
//! resilient call stack. Concurrent identical requests share one upstream
//! execution; the execution runs in its own task, so a caller that goes
//! away does not cancel it for the others.

use crate::config::CacheConfig;
use crate::metrics::Metrics;
use crate::upstream::{Completion, CompletionRequest, ServiceId, Upstream, UpstreamError};
use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Answers longer than this live for `long_ttl`
const LONG_ANSWER_CHARS: usize = 1000;

/// Shorter answers are never stored
const MIN_CACHEABLE_CHARS: usize = 10;

/// Phrases that mark an answer as stale soon after it was produced
static TIME_INDICATORS: &[&str] = &[
    "current time",
    "right now",
    "today",
    "yesterday",
    "tomorrow",
    "this morning",
    "this afternoon",
    "this evening",
    "tonight",
    "latest",
    "recent",
    "just now",
    "breaking news",
];

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: u64,
    pub in_flight: usize,
}

type Shared = Option<Result<Completion, UpstreamError>>;
type InFlight = Arc<Mutex<HashMap<String, watch::Receiver<Shared>>>>;

/// Per-entry TTL chosen from the answer length
struct ResponseExpiry {
    ttl: Duration,
    long_ttl: Duration,
}

impl ResponseExpiry {
    fn ttl_for(&self, completion: &Completion) -> Duration {
        if completion.text.chars().count() > LONG_ANSWER_CHARS {
            self.long_ttl
        } else {
            self.ttl
        }
    }
}

impl Expiry<String, Completion> for ResponseExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Completion,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.ttl_for(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Completion,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.ttl_for(value))
    }
}

/// Lowercase, trim and collapse internal whitespace
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute the cache key for a request bound for `service`
///
/// Key = SHA256(normalized text, service, model, system prompt, context digest)
pub fn fingerprint(service: ServiceId, model: &str, request: &CompletionRequest) -> String {
    let mut context = Sha256::new();
    for message in &request.context {
        context.update(message.role.as_str().as_bytes());
        context.update([0]);
        context.update(message.content.as_bytes());
        context.update([0]);
    }

    let mut hasher = Sha256::new();
    hasher.update(normalize(&request.text).as_bytes());
    hasher.update([0]);
    hasher.update(service.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(request.system_prompt.as_bytes());
    hasher.update([0]);
    hasher.update(context.finalize());

    hex::encode(hasher.finalize())
}

/// Whether a successful answer may be stored for later turns
pub fn should_store(request: &CompletionRequest, completion: &Completion) -> bool {
    if !request.cacheable || completion.text.trim().chars().count() < MIN_CACHEABLE_CHARS {
        return false;
    }
    let lower = completion.text.to_lowercase();
    !TIME_INDICATORS.iter().any(|indicator| lower.contains(indicator))
}

/// Removes the in-flight entry even if the leader task panics
struct InFlightGuard {
    in_flight: InFlight,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Call-stack layer: cache lookup plus single-flight on miss
pub struct CacheLayer<U> {
    inner: Arc<U>,
    cache: Cache<String, Completion>,
    in_flight: InFlight,
    models: HashMap<ServiceId, String>,
    metrics: Arc<Metrics>,
    enabled: bool,
}

impl<U: Upstream + 'static> CacheLayer<U> {
    pub fn new(inner: U, config: &CacheConfig, metrics: Arc<Metrics>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(ResponseExpiry {
                ttl: config.ttl,
                long_ttl: config.long_ttl,
            })
            .build();

        Self {
            inner: Arc::new(inner),
            cache,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            models: HashMap::new(),
            metrics,
            enabled: config.enabled,
        }
    }

    /// Include the model name of `service` in its fingerprints
    pub fn with_model(mut self, service: ServiceId, model: impl Into<String>) -> Self {
        self.models.insert(service, model.into());
        self
    }

    pub fn inner(&self) -> &U {
        &self.inner
    }

    pub fn key_for(&self, service: ServiceId, request: &CompletionRequest) -> String {
        let model = self.models.get(&service).map(String::as_str).unwrap_or("");
        fingerprint(service, model, request)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.entry_count(),
            in_flight: self.in_flight.lock().len(),
        }
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    fn spawn_leader(
        &self,
        key: String,
        service: ServiceId,
        request: CompletionRequest,
        tx: watch::Sender<Shared>,
    ) {
        let inner = Arc::clone(&self.inner);
        let cache = self.cache.clone();
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key,
        };

        tokio::spawn(async move {
            // A previous leader may have stored the answer after our lookup
            let result = match cache.get(&guard.key).await {
                Some(hit) => Ok(hit),
                None => inner.call(service, &request).await,
            };

            if let Ok(completion) = &result {
                if should_store(&request, completion) {
                    cache.insert(guard.key.clone(), completion.clone()).await;
                    debug!(service = %service, fingerprint = &guard.key[..12], "Cache SET");
                }
            }

            drop(guard);
            let _ = tx.send(Some(result));
        });
    }
}

#[async_trait]
impl<U: Upstream + 'static> Upstream for CacheLayer<U> {
    async fn call(
        &self,
        service: ServiceId,
        request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError> {
        if !self.enabled {
            return self.inner.call(service, request).await;
        }

        let key = self.key_for(service, request);
        if let Some(hit) = self.cache.get(&key).await {
            self.metrics.record_cache_hit();
            debug!(service = %service, fingerprint = &key[..12], "Cache HIT");
            return Ok(hit);
        }

        let mut rx = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(rx) => {
                    self.metrics.record_coalesced();
                    debug!(service = %service, fingerprint = &key[..12], "Joining in-flight request");
                    rx.clone()
                }
                None => {
                    self.metrics.record_cache_miss();
                    debug!(service = %service, fingerprint = &key[..12], "Cache MISS");
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.clone(), rx.clone());
                    self.spawn_leader(key.clone(), service, request.clone(), tx);
                    rx
                }
            }
        };

        let outcome: Shared = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };

        match outcome {
            Some(result) => result,
            None => {
                // Leader task died without publishing
                warn!(service = %service, fingerprint = &key[..12], "Shared request lost, calling directly");
                self.inner.call(service, request).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingUpstream {
        calls: AtomicU32,
        delay: Duration,
        reply: Result<Completion, UpstreamError>,
    }

    impl CountingUpstream {
        fn replying(text: &str, delay: Duration) -> Self {
            Self {
                calls: AtomicU32::new(0),
                delay,
                reply: Ok(Completion::text(text)),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for CountingUpstream {
        async fn call(
            &self,
            _service: ServiceId,
            _request: &CompletionRequest,
        ) -> Result<Completion, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn layer(upstream: CountingUpstream, ttl: Duration) -> Arc<CacheLayer<CountingUpstream>> {
        let config = CacheConfig {
            enabled: true,
            capacity: 100,
            ttl,
            long_ttl: ttl * 2,
        };
        Arc::new(CacheLayer::new(upstream, &config, Arc::new(Metrics::new())))
    }

    const ANSWER: &str = "Rust is a systems programming language.";

    #[test]
    fn test_fingerprint_normalizes_text() {
        let a = fingerprint(ServiceId::Generalist, "m", &CompletionRequest::new("Hello   World"));
        let b = fingerprint(ServiceId::Generalist, "m", &CompletionRequest::new("  hello world "));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_varies_with_context_and_service() {
        use crate::upstream::{ChatMessage, Role};

        let plain = CompletionRequest::new("and then?");
        let with_context = CompletionRequest::new("and then?")
            .with_context(vec![ChatMessage::new(Role::User, "tell me about ferris")]);

        let base = fingerprint(ServiceId::Generalist, "m", &plain);
        assert_ne!(base, fingerprint(ServiceId::Generalist, "m", &with_context));
        assert_ne!(base, fingerprint(ServiceId::WebSearch, "m", &plain));
        assert_ne!(base, fingerprint(ServiceId::Generalist, "other", &plain));
    }

    #[test]
    fn test_should_store_policy() {
        let request = CompletionRequest::new("q");
        assert!(should_store(&request, &Completion::text(ANSWER)));
        assert!(!should_store(&request, &Completion::text("ok")));
        assert!(!should_store(&request, &Completion::text("The latest figures show growth")));
        assert!(!should_store(&request.clone().with_cacheable(false), &Completion::text(ANSWER)));
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_share_one_call() {
        let cache = layer(
            CountingUpstream::replying(ANSWER, Duration::from_millis(50)),
            Duration::from_secs(60),
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .call(ServiceId::Generalist, &CompletionRequest::new("What is Rust?"))
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().text, ANSWER);
        }

        assert_eq!(cache.inner().calls(), 1);
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_hit_then_expiry_triggers_one_fresh_call() {
        let cache = layer(
            CountingUpstream::replying(ANSWER, Duration::ZERO),
            Duration::from_millis(100),
        );
        let request = CompletionRequest::new("What is Rust?");

        cache.call(ServiceId::Generalist, &request).await.unwrap();
        cache.call(ServiceId::Generalist, &request).await.unwrap();
        assert_eq!(cache.inner().calls(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        cache.call(ServiceId::Generalist, &request).await.unwrap();
        cache.call(ServiceId::Generalist, &request).await.unwrap();
        assert_eq!(cache.inner().calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_cancel_shared_call() {
        let cache = layer(
            CountingUpstream::replying(ANSWER, Duration::from_millis(100)),
            Duration::from_secs(60),
        );
        let request = CompletionRequest::new("What is Rust?");

        let first = tokio::time::timeout(
            Duration::from_millis(10),
            cache.call(ServiceId::Generalist, &request),
        )
        .await;
        assert!(first.is_err());

        let second = cache.call(ServiceId::Generalist, &request).await.unwrap();
        assert_eq!(second.text, ANSWER);
        assert_eq!(cache.inner().calls(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_shared_but_not_stored() {
        let upstream = CountingUpstream {
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            reply: Err(UpstreamError::Server(503)),
        };
        let cache = layer(upstream, Duration::from_secs(60));
        let request = CompletionRequest::new("What is Rust?");

        assert!(cache.call(ServiceId::Generalist, &request).await.is_err());
        assert!(cache.call(ServiceId::Generalist, &request).await.is_err());
        assert_eq!(cache.inner().calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_one_failure() {
        let upstream = CountingUpstream {
            calls: AtomicU32::new(0),
            delay: Duration::from_millis(50),
            reply: Err(UpstreamError::Server(503)),
        };
        let cache = layer(upstream, Duration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .call(ServiceId::Generalist, &CompletionRequest::new("What is Rust?"))
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(UpstreamError::Server(503)));
        }
        assert_eq!(cache.inner().calls(), 1);
        assert_eq!(cache.stats().in_flight, 0);

        // Nothing was stored, so the next caller goes upstream again
        let again = cache
            .call(ServiceId::Generalist, &CompletionRequest::new("What is Rust?"))
            .await;
        assert!(again.is_err());
        assert_eq!(cache.inner().calls(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let config = CacheConfig {
            enabled: true,
            capacity: 2,
            ttl: Duration::from_secs(60),
            long_ttl: Duration::from_secs(120),
        };
        let cache = CacheLayer::new(
            CountingUpstream::replying(ANSWER, Duration::ZERO),
            &config,
            Arc::new(Metrics::new()),
        );
        let first = CompletionRequest::new("What is Rust?");
        let second = CompletionRequest::new("What is Cargo?");
        let third = CompletionRequest::new("What is rustup?");

        cache.call(ServiceId::Generalist, &first).await.unwrap();
        cache.call(ServiceId::Generalist, &second).await.unwrap();
        cache.cache.run_pending_tasks().await;

        // Touch the first entry so the second becomes least recently used
        cache.call(ServiceId::Generalist, &first).await.unwrap();
        cache.cache.run_pending_tasks().await;
        assert_eq!(cache.inner().calls(), 2);

        cache.call(ServiceId::Generalist, &third).await.unwrap();
        cache.cache.run_pending_tasks().await;
        assert_eq!(cache.inner().calls(), 3);
        assert_eq!(cache.stats().entries, 2);

        cache.call(ServiceId::Generalist, &first).await.unwrap();
        cache.call(ServiceId::Generalist, &third).await.unwrap();
        assert_eq!(cache.inner().calls(), 3);

        cache.call(ServiceId::Generalist, &second).await.unwrap();
        assert_eq!(cache.inner().calls(), 4);
    }

    #[tokio::test]
    async fn test_uncacheable_requests_always_call() {
        let cache = layer(
            CountingUpstream::replying(ANSWER, Duration::ZERO),
            Duration::from_secs(60),
        );
        let request = CompletionRequest::new("price of bitcoin").with_cacheable(false);

        cache.call(ServiceId::WebSearch, &request).await.unwrap();
        cache.call(ServiceId::WebSearch, &request).await.unwrap();
        assert_eq!(cache.inner().calls(), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_passes_through() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = CacheLayer::new(
            CountingUpstream::replying(ANSWER, Duration::ZERO),
            &config,
            Arc::new(Metrics::new()),
        );
        let request = CompletionRequest::new("What is Rust?");

        cache.call(ServiceId::Generalist, &request).await.unwrap();
        cache.call(ServiceId::Generalist, &request).await.unwrap();
        assert_eq!(cache.inner().calls(), 2);
    }
}
