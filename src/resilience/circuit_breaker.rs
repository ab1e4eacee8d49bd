//! Per-provider circuit breaker.
//!
//! A breaker stops sending requests to a provider that keeps failing. HALF_OPEN
//! is never stored: it is derived at read time from an OPEN breaker whose open
//! timeout has elapsed, and the first caller to observe it takes the single
//! probe slot. The probe's outcome decides between CLOSED and a fresh OPEN
//! period.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN
//! OPEN --(open timeout elapsed, next request)--> HALF_OPEN (one probe)
//! HALF_OPEN --(probe succeeds)--> CLOSED
//! HALF_OPEN --(probe fails)--> OPEN
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerCounters {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub times_opened: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    pub health: HealthLevel,
    pub counters: BreakerCounters,
}

#[derive(Debug)]
struct BreakerState {
    open: bool,
    failure_count: u32,
    success_count: u64,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    counters: BreakerCounters,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            open: false,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_failure_at: None,
            probe_in_flight: false,
            counters: BreakerCounters::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pass,
    Probe,
    Reject,
}

pub struct CircuitBreaker {
    provider_id: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a request may go to the provider right now.
    ///
    /// When the open timeout has elapsed this hands out the single probe slot;
    /// the caller must follow up with [`record_success`](Self::record_success)
    /// or [`record_failure`](Self::record_failure). Prefer
    /// [`try_acquire`](Self::try_acquire), which releases the slot on drop.
    pub fn allow_request(&self) -> bool {
        self.admit() != Admission::Reject
    }

    /// Like [`allow_request`](Self::allow_request), but returns a permit that
    /// settles the outcome and frees an unsettled probe slot when dropped.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        match self.admit() {
            Admission::Reject => None,
            admission => Some(CallPermit {
                breaker: self,
                probe: admission == Admission::Probe,
                settled: false,
            }),
        }
    }

    fn admit(&self) -> Admission {
        let mut state = self.state.lock();

        if !state.open {
            state.counters.total_requests += 1;
            return Admission::Pass;
        }

        let elapsed = state
            .opened_at
            .map(|opened_at| opened_at.elapsed() >= self.config.open_timeout())
            .unwrap_or(true);

        if elapsed && !state.probe_in_flight {
            state.probe_in_flight = true;
            state.counters.total_requests += 1;
            tracing::info!(
                provider = %self.provider_id,
                "Circuit half-open, allowing probe request"
            );
            Admission::Probe
        } else {
            state.counters.rejections += 1;
            Admission::Reject
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.success_count += 1;
        state.counters.successes += 1;
        state.counters.consecutive_failures = 0;
        state.failure_count = 0;

        if state.open {
            state.open = false;
            state.opened_at = None;
            state.probe_in_flight = false;
            tracing::info!(
                provider = %self.provider_id,
                "Circuit closed after successful recovery"
            );
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(Utc::now());
        state.counters.failures += 1;
        state.counters.consecutive_failures = state.counters.consecutive_failures.saturating_add(1);

        if state.probe_in_flight {
            state.probe_in_flight = false;
            state.opened_at = Some(Instant::now());
            state.counters.times_opened += 1;
            tracing::warn!(
                provider = %self.provider_id,
                open_timeout_ms = self.config.open_timeout_ms,
                "Circuit reopened after failed recovery probe"
            );
        } else if !state.open && state.failure_count >= self.config.failure_threshold {
            state.open = true;
            state.opened_at = Some(Instant::now());
            state.counters.times_opened += 1;
            tracing::warn!(
                provider = %self.provider_id,
                failures = state.failure_count,
                open_timeout_ms = self.config.open_timeout_ms,
                "Circuit opened after repeated failures"
            );
        }
    }

    /// Give back a probe slot without recording an outcome.
    fn release_probe(&self) {
        let mut state = self.state.lock();
        if state.probe_in_flight {
            state.probe_in_flight = false;
            tracing::debug!(provider = %self.provider_id, "Probe released without outcome");
        }
    }

    pub fn state(&self) -> CircuitState {
        let state = self.state.lock();
        self.derive_state(&state)
    }

    fn derive_state(&self, state: &BreakerState) -> CircuitState {
        if !state.open {
            return CircuitState::Closed;
        }
        let elapsed = state
            .opened_at
            .map(|opened_at| opened_at.elapsed() >= self.config.open_timeout())
            .unwrap_or(true);
        if state.probe_in_flight || elapsed {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        let current = self.derive_state(&state);
        BreakerSnapshot {
            provider_id: self.provider_id.clone(),
            state: current,
            failure_count: state.failure_count,
            success_count: state.success_count,
            failure_threshold: self.config.failure_threshold,
            open_timeout_ms: self.config.open_timeout_ms,
            last_failure_at: state.last_failure_at,
            health: health_level(current, &state.counters),
            counters: state.counters.clone(),
        }
    }

    /// Force the breaker back to CLOSED, clearing counters.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::closed();
        tracing::info!(provider = %self.provider_id, "Circuit manually reset");
    }
}

fn health_level(state: CircuitState, counters: &BreakerCounters) -> HealthLevel {
    if state != CircuitState::Closed {
        return HealthLevel::Critical;
    }
    if counters.consecutive_failures >= 3 {
        return HealthLevel::Warning;
    }
    let settled = counters.successes + counters.failures;
    if settled > 0 && (counters.successes as f64 / settled as f64) < 0.9 {
        return HealthLevel::Degraded;
    }
    HealthLevel::Healthy
}

/// Admission to call a provider through its breaker.
///
/// Dropping an unsettled probe permit (cancellation, a dropped future) frees the
/// probe slot without counting a success or failure.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}
