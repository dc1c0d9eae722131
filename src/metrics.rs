//! Metrics & Monitoring
//!
//! Per-service call outcomes, latency, routing decisions and cache behaviour.
//! Counters are atomics; the label map and latency window sit behind
//! short-held `parking_lot` locks.

use crate::upstream::ServiceId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latency samples kept per service
const LATENCY_WINDOW: usize = 1000;

/// Counters for one upstream service
#[derive(Debug, Default)]
struct ServiceCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    breaker_rejections: AtomicU64,
    answered: AtomicU64,
    total_latency_ms: AtomicU64,
    latencies: Mutex<VecDeque<u64>>,
}

/// Latency percentiles
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
    pub min_ms: u64,
}

/// Per-service view
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub breaker_rejections: u64,
    /// Turns this service ended up answering
    pub answered: u64,
    pub avg_latency_ms: f64,
    pub latency: LatencyStats,
}

/// Serializable snapshot for health reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub turns: u64,
    pub fallbacks: u64,
    pub degraded: u64,
    pub rejected_inputs: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_coalesced: u64,
    pub cache_hit_rate: f64,
    pub routing: BTreeMap<String, u64>,
    pub services: BTreeMap<String, ServiceMetrics>,
}

/// Real-time metrics collector
#[derive(Debug, Default)]
pub struct Metrics {
    generalist: ServiceCounters,
    web_search: ServiceCounters,
    turns: AtomicU64,
    fallbacks: AtomicU64,
    degraded: AtomicU64,
    rejected_inputs: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_coalesced: AtomicU64,
    routing: Mutex<BTreeMap<&'static str, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, service: ServiceId) -> &ServiceCounters {
        match service {
            ServiceId::Generalist => &self.generalist,
            ServiceId::WebSearch => &self.web_search,
        }
    }

    /// Record one attempt that reached the provider
    pub fn record_attempt(&self, service: ServiceId, latency: Duration, success: bool) {
        let counters = self.counters(service);
        let latency_ms = latency.as_millis() as u64;

        counters.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        counters.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let mut window = counters.latencies.lock();
        window.push_back(latency_ms);
        if window.len() > LATENCY_WINDOW {
            window.pop_front();
        }
    }

    pub fn record_retry(&self, service: ServiceId) {
        self.counters(service).retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_rejection(&self, service: ServiceId) {
        self.counters(service)
            .breaker_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a routing decision by its trigger labels
    pub fn record_route(&self, labels: &[&'static str]) {
        self.turns.fetch_add(1, Ordering::Relaxed);
        let mut routing = self.routing.lock();
        for label in labels {
            *routing.entry(*label).or_insert(0) += 1;
        }
    }

    pub fn record_answer(&self, service: ServiceId, fell_back: bool) {
        self.counters(service).answered.fetch_add(1, Ordering::Relaxed);
        if fell_back {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_input(&self) {
        self.rejected_inputs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller attached to an in-flight computation
    pub fn record_coalesced(&self) {
        self.cache_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    fn service_metrics(&self, service: ServiceId) -> ServiceMetrics {
        let c = self.counters(service);
        let attempts = c.attempts.load(Ordering::Relaxed);
        let total_latency = c.total_latency_ms.load(Ordering::Relaxed);

        let mut latencies: Vec<u64> = c.latencies.lock().iter().copied().collect();
        latencies.sort_unstable();

        ServiceMetrics {
            attempts,
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            breaker_rejections: c.breaker_rejections.load(Ordering::Relaxed),
            answered: c.answered.load(Ordering::Relaxed),
            avg_latency_ms: if attempts > 0 {
                total_latency as f64 / attempts as f64
            } else {
                0.0
            },
            latency: latency_stats(&latencies),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);

        MetricsSnapshot {
            turns: self.turns.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            rejected_inputs: self.rejected_inputs.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_coalesced: self.cache_coalesced.load(Ordering::Relaxed),
            cache_hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64 * 100.0
            } else {
                0.0
            },
            routing: self
                .routing
                .lock()
                .iter()
                .map(|(label, count)| (label.to_string(), *count))
                .collect(),
            services: ServiceId::ALL
                .into_iter()
                .map(|id| (id.as_str().to_string(), self.service_metrics(id)))
                .collect(),
        }
    }
}

/// Percentiles over sorted samples
fn latency_stats(sorted: &[u64]) -> LatencyStats {
    if sorted.is_empty() {
        return LatencyStats::default();
    }

    let len = sorted.len();
    LatencyStats {
        p50_ms: sorted.get(len / 2).copied().unwrap_or(0),
        p90_ms: sorted.get(len * 90 / 100).copied().unwrap_or(0),
        p99_ms: sorted.get(len * 99 / 100).copied().unwrap_or(0),
        max_ms: sorted.last().copied().unwrap_or(0),
        min_ms: sorted.first().copied().unwrap_or(0),
    }
}
