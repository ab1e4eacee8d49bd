use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cost::{BudgetStatus, CostTotals};
use crate::resilience::{BreakerSnapshot, CircuitState};

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
    recoveries: AtomicU64,
    cache_hits: AtomicU64,
    rate_limited: AtomicU64,
    cancelled: AtomicU64,
}

impl DispatchMetrics {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// The request ended on an offline reply.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// The primary provider could not answer.
    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// A fallback source answered after the primary failed.
    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> MetricCounters {
        MetricCounters {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            fallbacks_triggered: self.fallbacks.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricCounters {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub fallbacks_triggered: u64,
    pub recoveries: u64,
    pub cache_hits: u64,
    pub rate_limited: u64,
    pub cancelled: u64,
}

impl MetricCounters {
    pub fn success_rate(&self) -> f64 {
        ratio(self.successes, self.total_requests)
    }

    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hits, self.total_requests)
    }

    pub fn recovery_rate(&self) -> f64 {
        ratio(self.recoveries, self.fallbacks_triggered)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: MetricCounters,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub recovery_rate: f64,
    pub breaker_states: BTreeMap<String, CircuitState>,
    pub breakers: Vec<BreakerSnapshot>,
    pub cache_entries: usize,
    pub active_sessions: usize,
    pub rate_limited_keys: usize,
    pub costs: CostTotals,
    pub budget: BudgetStatus,
}
