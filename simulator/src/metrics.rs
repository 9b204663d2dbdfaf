use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKETS_MS: [u64; 8] = [1, 5, 10, 50, 100, 500, 1000, 5000];

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpMetricsSnapshot {
    pub requests: u64,
    pub rewarded: u64,
    pub rate_limited: u64,
    pub unauthorized: u64,
    pub bad_requests: u64,
    pub injected_failures: u64,
    pub latency_buckets_ms: Vec<u64>,
    pub latency_counts: Vec<u64>,
    pub latency_overflow: u64,
    pub max_latency_ms: u64,
}

/// Counters for API responses, by outcome.
#[derive(Default)]
pub struct HttpMetrics {
    requests: AtomicU64,
    rewarded: AtomicU64,
    rate_limited: AtomicU64,
    unauthorized: AtomicU64,
    bad_requests: AtomicU64,
    injected_failures: AtomicU64,
    latency: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    latency_overflow: AtomicU64,
    max_latency_ms: AtomicU64,
}

impl HttpMetrics {
    pub fn record(&self, status: u16, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            200 => Some(&self.rewarded),
            400 => Some(&self.bad_requests),
            401 => Some(&self.unauthorized),
            429 => Some(&self.rate_limited),
            503 => Some(&self.injected_failures),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.max_latency_ms.fetch_max(ms, Ordering::Relaxed);
        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.latency[idx].fetch_add(1, Ordering::Relaxed),
            None => self.latency_overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rewarded: self.rewarded.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            bad_requests: self.bad_requests.load(Ordering::Relaxed),
            injected_failures: self.injected_failures.load(Ordering::Relaxed),
            latency_buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            latency_counts: self
                .latency
                .iter()
                .map(|count| count.load(Ordering::Relaxed))
                .collect(),
            latency_overflow: self.latency_overflow.load(Ordering::Relaxed),
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
        }
    }
}
