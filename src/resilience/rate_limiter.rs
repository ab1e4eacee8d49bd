//! Sliding-window admission control keyed by caller identity.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Keys idle for this many windows are dropped by a sweep.
const IDLE_WINDOWS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    pub reset_at: DateTime<Utc>,
    /// Zero when allowed.
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub max_requests: usize,
    pub window_ms: u64,
}

/// Admitted request instants within the trailing window, oldest first.
#[derive(Debug, Default)]
struct Window {
    admits: VecDeque<Instant>,
    last_seen: Option<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.admits.front() {
            if now.duration_since(*oldest) >= window {
                self.admits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// At most `max_requests` admits per trailing `window_ms` for each key.
///
/// Denied attempts are not recorded, so a caller hammering a closed window does
/// not push its own reset further out.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `key` may proceed. Never fails.
    pub fn admit(&self, key: &str) -> RateLimitDecision {
        if self.config.sweep_probability > 0.0
            && rand::random::<f64>() < self.config.sweep_probability
        {
            self.sweep();
        }

        let window = self.config.window();
        let limit = self.config.max_requests;
        let now = Instant::now();

        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_default();
        entry.prune(now, window);
        entry.last_seen = Some(now);

        if entry.admits.len() >= limit {
            let retry_after = entry
                .admits
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window)
                .max(Duration::from_millis(1));

            tracing::debug!(
                key = %key,
                limit = limit,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );

            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: wall_clock_after(retry_after),
                retry_after_ms: retry_after.as_millis() as u64,
            };
        }

        entry.admits.push_back(now);
        let until_reset = entry
            .admits
            .front()
            .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(window);

        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - entry.admits.len(),
            reset_at: wall_clock_after(until_reset),
            retry_after_ms: 0,
        }
    }

    /// Drop keys that have been idle for five windows.
    pub fn sweep(&self) -> usize {
        let idle = self.config.window() * IDLE_WINDOWS;
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.last_seen
                .map(|seen| now.duration_since(seen) < idle)
                .unwrap_or(false)
        });
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Swept idle rate limit windows");
        }
        removed
    }

    /// Forget everything recorded for `key`.
    pub fn reset(&self, key: &str) {
        self.windows.lock().remove(key);
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            tracked_keys: self.windows.lock().len(),
            max_requests: self.config.max_requests,
            window_ms: self.config.window_ms,
        }
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64)
}
